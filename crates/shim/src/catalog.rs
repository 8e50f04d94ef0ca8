//! The closed set of Direct3D 11 and DXGI entry points the shim can intercept.

use gfx_shim_common::{config::ShimConfig, identity::TargetIdentity};
use tracing::warn;

use crate::registry::HookSpec;

/// An interception point with an interceptor compiled into the shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum HookPoint {
    /// `d3d11.dll!D3D11CreateDevice`
    CreateDevice,

    /// `ID3D11Device::CreateTexture2D`
    CreateTexture2D,

    /// `IDXGISwapChain::Present`
    Present,

    /// `ID3D11DeviceContext::DrawIndexed`
    DrawIndexed,

    /// `ID3D11DeviceContext::Draw`
    Draw,

    /// `ID3D11DeviceContext::Map`
    Map,

    /// `ID3D11VideoContext::VideoProcessorBlt`
    VideoProcessorBlt,

    /// `ID3D11VideoContext::VideoProcessorSetStreamColorSpace`
    VideoProcessorSetStreamColorSpace,

    /// `ID3D11VideoContext::VideoProcessorSetOutputColorSpace`
    VideoProcessorSetOutputColorSpace,
}

impl HookPoint {
    pub const COUNT: usize = 9;

    pub const ALL: [Self; Self::COUNT] = [
        Self::CreateDevice,
        Self::CreateTexture2D,
        Self::Present,
        Self::DrawIndexed,
        Self::Draw,
        Self::Map,
        Self::VideoProcessorBlt,
        Self::VideoProcessorSetStreamColorSpace,
        Self::VideoProcessorSetOutputColorSpace,
    ];

    pub const fn identity(self) -> TargetIdentity {
        match self {
            Self::CreateDevice => TargetIdentity::export("d3d11.dll", "D3D11CreateDevice"),
            Self::CreateTexture2D => TargetIdentity::vtable_slot("ID3D11Device", 5),
            Self::Present => TargetIdentity::vtable_slot("IDXGISwapChain", 8),
            Self::DrawIndexed => TargetIdentity::vtable_slot("ID3D11DeviceContext", 12),
            Self::Draw => TargetIdentity::vtable_slot("ID3D11DeviceContext", 13),
            Self::Map => TargetIdentity::vtable_slot("ID3D11DeviceContext", 14),
            Self::VideoProcessorBlt => TargetIdentity::vtable_slot("ID3D11VideoContext", 53),
            Self::VideoProcessorSetStreamColorSpace => {
                TargetIdentity::vtable_slot("ID3D11VideoContext", 28)
            }
            Self::VideoProcessorSetOutputColorSpace => {
                TargetIdentity::vtable_slot("ID3D11VideoContext", 15)
            }
        }
    }

    pub fn from_identity(identity: &TargetIdentity) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|point| point.identity() == *identity)
    }
}

/// Build the hook specs requested by `config`.
///
/// Without configured hook points every point is selected with rewrites off.
/// Entries whose identity does not parse are logged and skipped. Entries naming
/// a target outside the catalog are kept without an interceptor, so the registry
/// reports them as unresolved.
pub fn select(config: &ShimConfig, detour: impl Fn(HookPoint) -> usize) -> Vec<HookSpec> {
    let Some(points) = &config.hook_points else {
        return HookPoint::ALL
            .into_iter()
            .map(|point| HookSpec {
                target: point.identity(),
                detour: Some(detour(point)),
                rewrite: false,
            })
            .collect();
    };

    points
        .iter()
        .filter_map(|point| match point.identity() {
            Ok(target) => Some(HookSpec {
                detour: HookPoint::from_identity(&target).map(&detour),
                target,
                rewrite: point.rewrite,
            }),

            Err(err) => {
                warn!("skipping hook point. err: {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use gfx_shim_common::config::HookPointConfig;

    use super::*;

    fn fake_detour(point: HookPoint) -> usize {
        0x1000 + point as usize
    }

    #[test]
    fn identities_round_trip() {
        for point in HookPoint::ALL {
            let text = point.identity().to_string();
            let parsed: TargetIdentity = text.parse().unwrap();
            assert_eq!(HookPoint::from_identity(&parsed), Some(point));
        }
    }

    #[test]
    fn default_config_selects_every_point() {
        let specs = select(&ShimConfig::default(), fake_detour);

        assert_eq!(specs.len(), HookPoint::COUNT);
        assert!(specs.iter().all(|spec| !spec.rewrite && spec.detour.is_some()));
        assert_eq!(specs[2].target, HookPoint::Present.identity());
        assert_eq!(specs[2].detour, Some(0x1002));
        assert_eq!(specs[6].target.to_string(), "ID3D11VideoContext#53");
    }

    #[test]
    fn video_context_points_name_their_methods() {
        let parse = |text: &str| HookPoint::from_identity(&text.parse().unwrap());

        assert_eq!(parse("ID3D11VideoContext#53"), Some(HookPoint::VideoProcessorBlt));
        assert_eq!(
            parse("ID3D11VideoContext#28"),
            Some(HookPoint::VideoProcessorSetStreamColorSpace)
        );
        assert_eq!(
            parse("ID3D11VideoContext#15"),
            Some(HookPoint::VideoProcessorSetOutputColorSpace)
        );
        // Getters share the interface but have no interceptor.
        assert_eq!(parse("ID3D11VideoContext#22"), None);
    }

    #[test]
    fn configured_points_keep_order_and_flags() {
        let config = ShimConfig {
            hook_points: Some(vec![
                HookPointConfig {
                    target: "ID3D11Device#5".to_owned(),
                    rewrite: true,
                },
                HookPointConfig {
                    target: "bogus".to_owned(),
                    rewrite: false,
                },
                HookPointConfig {
                    target: "kernel32.dll!Sleep".to_owned(),
                    rewrite: false,
                },
            ]),
            ..Default::default()
        };
        let specs = select(&config, fake_detour);

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].target, HookPoint::CreateTexture2D.identity());
        assert!(specs[0].rewrite);
        assert_eq!(specs[0].detour, Some(0x1001));

        assert_eq!(specs[1].target.to_string(), "kernel32.dll!Sleep");
        assert_eq!(specs[1].detour, None);
    }
}
