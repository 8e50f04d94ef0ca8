//! Argument rewrites and value names for Direct3D 11 calls.
//!
//! Everything here works on plain integers so it can be checked without a device.

use crate::dispatch::RewriteError;

/// `D3D11_RESOURCE_MISC_SHARED`
pub const MISC_SHARED: u32 = 0x2;

/// `D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX`
pub const MISC_SHARED_KEYEDMUTEX: u32 = 0x100;

/// `D3D11_RESOURCE_MISC_SHARED_NTHANDLE`
pub const MISC_SHARED_NTHANDLE: u32 = 0x800;

/// `D3D_FEATURE_LEVEL_11_1`, the highest level the rewrite lets through.
pub const MAX_FEATURE_LEVEL: u32 = 0xb100;

/// Replace keyed-mutex and NT-handle sharing with legacy sharing.
///
/// Returns `None` when the flags need no change.
pub fn texture_misc_flags(flags: u32) -> Option<u32> {
    let modern = MISC_SHARED_KEYEDMUTEX | MISC_SHARED_NTHANDLE;
    if flags & modern == 0 {
        return None;
    }

    Some(flags & !modern | MISC_SHARED)
}

/// Drop requested feature levels above 11.1.
///
/// Returns `None` when every level is kept. An empty request is left to the
/// runtime's defaults, but a request that would become empty is refused.
pub fn supported_feature_levels(levels: &[u32]) -> Result<Option<Vec<u32>>, RewriteError> {
    if levels.iter().all(|&level| level <= MAX_FEATURE_LEVEL) {
        return Ok(None);
    }

    let kept = levels
        .iter()
        .copied()
        .filter(|&level| level <= MAX_FEATURE_LEVEL)
        .collect::<Vec<_>>();
    if kept.is_empty() {
        return Err(RewriteError::Empty("feature_levels"));
    }

    Ok(Some(kept))
}

pub fn feature_level_name(level: u32) -> Option<&'static str> {
    Some(match level {
        0x9100 => "9_1",
        0x9200 => "9_2",
        0x9300 => "9_3",
        0xa000 => "10_0",
        0xa100 => "10_1",
        0xb000 => "11_0",
        0xb100 => "11_1",
        0xc000 => "12_0",
        0xc100 => "12_1",
        0xc200 => "12_2",
        _ => return None,
    })
}

/// Name of a `DXGI_FORMAT` value, without the prefix.
pub fn format_name(format: u32) -> Option<&'static str> {
    Some(match format {
        0 => "UNKNOWN",
        2 => "R32G32B32A32_FLOAT",
        10 => "R16G16B16A16_FLOAT",
        24 => "R10G10B10A2_UNORM",
        28 => "R8G8B8A8_UNORM",
        29 => "R8G8B8A8_UNORM_SRGB",
        35 => "R16G16_FLOAT",
        40 => "D32_FLOAT",
        41 => "R32_FLOAT",
        45 => "D24_UNORM_S8_UINT",
        49 => "R8G8_UNORM",
        56 => "R16_UNORM",
        61 => "R8_UNORM",
        71 => "BC1_UNORM",
        77 => "BC3_UNORM",
        87 => "B8G8R8A8_UNORM",
        88 => "B8G8R8X8_UNORM",
        91 => "B8G8R8A8_UNORM_SRGB",
        98 => "BC7_UNORM",
        100 => "AYUV",
        101 => "Y410",
        102 => "Y416",
        103 => "NV12",
        104 => "P010",
        105 => "P016",
        106 => "420_OPAQUE",
        107 => "YUY2",
        108 => "Y210",
        109 => "Y216",
        110 => "NV11",
        130 => "P208",
        131 => "V208",
        132 => "V408",
        _ => return None,
    })
}

/// Whether `format` is a YUV format used for video surfaces.
pub fn is_video_format(format: u32) -> bool {
    matches!(format, 100..=110 | 130..=132)
}

/// `D3D11_MAP` names.
pub fn map_type_name(map_type: u32) -> Option<&'static str> {
    Some(match map_type {
        1 => "READ",
        2 => "WRITE",
        3 => "READ_WRITE",
        4 => "WRITE_DISCARD",
        5 => "WRITE_NO_OVERWRITE",
        _ => return None,
    })
}

/// Fields of a packed `D3D11_VIDEO_PROCESSOR_COLOR_SPACE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorSpace {
    /// 0 for playback, 1 for video processing.
    pub usage: u32,

    /// 0 for full range RGB, 1 for studio range.
    pub rgb_range: u32,

    /// 0 for BT.601, 1 for BT.709.
    pub ycbcr_matrix: u32,

    pub ycbcr_xvycc: u32,

    /// `D3D11_VIDEO_PROCESSOR_NOMINAL_RANGE`
    pub nominal_range: u32,
}

impl ColorSpace {
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            usage: bits & 1,
            rgb_range: (bits >> 1) & 1,
            ycbcr_matrix: (bits >> 2) & 1,
            ycbcr_xvycc: (bits >> 3) & 1,
            nominal_range: (bits >> 4) & 3,
        }
    }

    pub const fn rgb_range_name(self) -> &'static str {
        if self.rgb_range == 0 { "0_255" } else { "16_235" }
    }

    pub const fn ycbcr_matrix_name(self) -> &'static str {
        if self.ycbcr_matrix == 0 { "BT601" } else { "BT709" }
    }

    pub const fn nominal_range_name(self) -> Option<&'static str> {
        Some(match self.nominal_range {
            0 => "UNDEFINED",
            1 => "16_235",
            2 => "0_255",
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_sharing_becomes_legacy() {
        assert_eq!(texture_misc_flags(0), None);
        assert_eq!(texture_misc_flags(MISC_SHARED), None);
        assert_eq!(texture_misc_flags(MISC_SHARED_KEYEDMUTEX), Some(MISC_SHARED));
        assert_eq!(
            texture_misc_flags(MISC_SHARED_KEYEDMUTEX | MISC_SHARED_NTHANDLE),
            Some(MISC_SHARED)
        );

        // D3D11_RESOURCE_MISC_GENERATE_MIPS stays
        assert_eq!(
            texture_misc_flags(0x1 | MISC_SHARED_NTHANDLE),
            Some(0x1 | MISC_SHARED)
        );
    }

    #[test]
    fn feature_levels_are_capped() {
        assert_eq!(supported_feature_levels(&[]).unwrap(), None);
        assert_eq!(
            supported_feature_levels(&[0xb100, 0xb000, 0xa100]).unwrap(),
            None
        );
        assert_eq!(
            supported_feature_levels(&[0xc100, 0xc000, 0xb100, 0xb000]).unwrap(),
            Some(vec![0xb100, 0xb000])
        );
        assert!(matches!(
            supported_feature_levels(&[0xc200, 0xc100]),
            Err(RewriteError::Empty("feature_levels"))
        ));
    }

    #[test]
    fn names() {
        assert_eq!(format_name(103), Some("NV12"));
        assert_eq!(format_name(87), Some("B8G8R8A8_UNORM"));
        assert_eq!(format_name(9999), None);
        assert_eq!(feature_level_name(0xb000), Some("11_0"));
        assert_eq!(map_type_name(4), Some("WRITE_DISCARD"));

        assert!(is_video_format(104));
        assert!(is_video_format(131));
        assert!(!is_video_format(87));
    }

    #[test]
    fn color_space_bits_unpack() {
        // Studio range BT.709 for video processing, nominal 16-235
        let space = ColorSpace::from_bits(0b01_0111);
        assert_eq!(
            space,
            ColorSpace {
                usage: 1,
                rgb_range: 1,
                ycbcr_matrix: 1,
                ycbcr_xvycc: 0,
                nominal_range: 1,
            }
        );
        assert_eq!(space.rgb_range_name(), "16_235");
        assert_eq!(space.ycbcr_matrix_name(), "BT709");
        assert_eq!(space.nominal_range_name(), Some("16_235"));

        let full = ColorSpace::from_bits(0b10_1000);
        assert_eq!(full.ycbcr_xvycc, 1);
        assert_eq!(full.rgb_range_name(), "0_255");
        assert_eq!(full.ycbcr_matrix_name(), "BT601");
        assert_eq!(full.nominal_range_name(), Some("0_255"));

        // Reserved bits are ignored.
        assert_eq!(ColorSpace::from_bits(0xFFFF_FFC0), ColorSpace::from_bits(0));
        assert_eq!(ColorSpace::from_bits(0b11_0000).nominal_range_name(), None);
    }
}
