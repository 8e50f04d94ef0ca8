//! Names of interception targets.

use core::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use std::borrow::Cow;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::config::ConfigError;

/// How a target is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// A function exported by name from a module.
    Export,

    /// An entry of an interface's virtual method table.
    VTableSlot,
}

/// Identity of one interception point.
///
/// Text form is `module!symbol` for exports (`d3d11.dll!D3D11CreateDevice`)
/// and `Interface#slot` for virtual table slots (`ID3D11Device#5`).
/// Module names are case-insensitive and kept in lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetIdentity {
    Export {
        module: Cow<'static, str>,
        symbol: Cow<'static, str>,
    },
    VTableSlot {
        interface: Cow<'static, str>,
        index: usize,
    },
}

impl TargetIdentity {
    /// `module` must already be lowercase.
    pub const fn export(module: &'static str, symbol: &'static str) -> Self {
        Self::Export {
            module: Cow::Borrowed(module),
            symbol: Cow::Borrowed(symbol),
        }
    }

    pub const fn vtable_slot(interface: &'static str, index: usize) -> Self {
        Self::VTableSlot {
            interface: Cow::Borrowed(interface),
            index,
        }
    }

    pub const fn kind(&self) -> HookKind {
        match self {
            Self::Export { .. } => HookKind::Export,
            Self::VTableSlot { .. } => HookKind::VTableSlot,
        }
    }
}

impl Display for TargetIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Export { module, symbol } => write!(f, "{module}!{symbol}"),
            Self::VTableSlot { interface, index } => write!(f, "{interface}#{index}"),
        }
    }
}

impl FromStr for TargetIdentity {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ConfigError::InvalidIdentity {
            text: text.to_owned(),
            reason,
        };

        if text.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        match (text.split_once('!'), text.split_once('#')) {
            (Some((module, symbol)), None) => {
                if module.is_empty() || symbol.is_empty() {
                    return Err(invalid("module and symbol must not be empty"));
                }
                if symbol.contains('!') {
                    return Err(invalid("more than one `!`"));
                }

                Ok(Self::Export {
                    module: Cow::Owned(module.to_ascii_lowercase()),
                    symbol: Cow::Owned(symbol.to_owned()),
                })
            }

            (None, Some((interface, index))) => {
                if interface.is_empty()
                    || !interface
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(invalid("interface must be an identifier"));
                }
                if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid("slot must be a decimal number"));
                }
                let index = index.parse().map_err(|_| invalid("slot out of range"))?;

                Ok(Self::VTableSlot {
                    interface: Cow::Owned(interface.to_owned()),
                    index,
                })
            }

            (Some(_), Some(_)) => Err(invalid("mixes `!` and `#`")),
            (None, None) => Err(invalid("expected `module!symbol` or `Interface#slot`")),
        }
    }
}

impl Serialize for TargetIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TargetIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = Cow::<'de, str>::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
