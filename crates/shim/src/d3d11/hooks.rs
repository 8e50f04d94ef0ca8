//! Interceptor stubs of the catalog's hook points.

use core::{ffi::c_void, mem, ptr, slice};

use gfx_shim_common::record::{Argument, ArgumentSnapshot, Value};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};
use windows::{
    Win32::Graphics::{
        Direct3D::D3D_FEATURE_LEVEL,
        Direct3D11::{
            D3D11_TEXTURE2D_DESC, D3D11_VIDEO_PROCESSOR_COLOR_SPACE, D3D11_VIDEO_PROCESSOR_STREAM,
        },
    },
    core::HRESULT,
};

use crate::{
    Shim,
    catalog::HookPoint,
    dispatch::{self, CallArgs, NoRewrite, Rewrite, RewriteError},
    registry::{HookDescriptor, Registry},
    rules::{self, ColorSpace},
};

static BOUND: [OnceCell<&'static HookDescriptor>; HookPoint::COUNT] =
    [const { OnceCell::new() }; HookPoint::COUNT];

/// Let each stub find its descriptor. Must run before any hook is installed.
pub fn bind(registry: &'static Registry) {
    for point in HookPoint::ALL {
        if let Some(descriptor) = registry.get(&point.identity()) {
            _ = BOUND[point as usize].set(descriptor);
        }
    }
}

/// Address of the stub intercepting `point`.
pub fn detour(point: HookPoint) -> usize {
    match point {
        HookPoint::CreateDevice => hooked_create_device as usize,
        HookPoint::CreateTexture2D => hooked_create_texture_2d as usize,
        HookPoint::Present => hooked_present as usize,
        HookPoint::DrawIndexed => hooked_draw_indexed as usize,
        HookPoint::Draw => hooked_draw as usize,
        HookPoint::Map => hooked_map as usize,
        HookPoint::VideoProcessorBlt => hooked_video_processor_blt as usize,
        HookPoint::VideoProcessorSetStreamColorSpace => hooked_set_stream_color_space as usize,
        HookPoint::VideoProcessorSetOutputColorSpace => hooked_set_output_color_space as usize,
    }
}

// Stubs are only reachable after install, which happens after `bind`.
fn bound(point: HookPoint) -> (&'static Shim, &'static HookDescriptor) {
    (Shim::wait(), BOUND[point as usize].wait())
}

type CreateDeviceFn = unsafe extern "system" fn(
    *mut c_void,
    i32,
    *mut c_void,
    u32,
    *const D3D_FEATURE_LEVEL,
    u32,
    u32,
    *mut *mut c_void,
    *mut D3D_FEATURE_LEVEL,
    *mut *mut c_void,
) -> HRESULT;

#[derive(Clone)]
struct CreateDeviceArgs {
    adapter: *mut c_void,
    driver_type: i32,
    software: *mut c_void,
    flags: u32,
    feature_levels: *const D3D_FEATURE_LEVEL,
    feature_level_count: u32,
    sdk_version: u32,
    device: *mut *mut c_void,
    feature_level: *mut D3D_FEATURE_LEVEL,
    immediate_context: *mut *mut c_void,

    /// Requested levels copied at entry.
    requested: Vec<D3D_FEATURE_LEVEL>,
    replaced_levels: bool,
}

impl CreateDeviceArgs {
    fn levels(&self) -> (*const D3D_FEATURE_LEVEL, u32) {
        if self.replaced_levels {
            (self.requested.as_ptr(), self.requested.len() as u32)
        } else {
            (self.feature_levels, self.feature_level_count)
        }
    }
}

impl CallArgs for CreateDeviceArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        let levels = self
            .requested
            .iter()
            .map(|level| match rules::feature_level_name(level.0 as u32) {
                Some(name) => Value::name(name),
                None => Value::Hex(level.0 as u32 as u64),
            })
            .collect();

        vec![
            Argument::new("adapter", Value::ptr(self.adapter)),
            Argument::new("driver_type", Value::I64(self.driver_type.into())),
            Argument::new("flags", Value::Hex(self.flags.into())),
            Argument::new("feature_levels", Value::List(levels)),
            Argument::new("sdk_version", Value::U64(self.sdk_version.into())),
        ]
    }
}

struct FeatureLevelRewrite;

impl Rewrite<CreateDeviceArgs, HRESULT> for FeatureLevelRewrite {
    fn rewrite_args(&self, args: &CreateDeviceArgs) -> Result<Option<CreateDeviceArgs>, RewriteError> {
        let requested = args
            .requested
            .iter()
            .map(|level| level.0 as u32)
            .collect::<Vec<_>>();

        Ok(rules::supported_feature_levels(&requested)?.map(|kept| CreateDeviceArgs {
            requested: kept
                .into_iter()
                .map(|level| D3D_FEATURE_LEVEL(level as i32))
                .collect(),
            replaced_levels: true,
            ..args.clone()
        }))
    }
}

#[allow(clippy::too_many_arguments)]
extern "system" fn hooked_create_device(
    adapter: *mut c_void,
    driver_type: i32,
    software: *mut c_void,
    flags: u32,
    feature_levels: *const D3D_FEATURE_LEVEL,
    feature_level_count: u32,
    sdk_version: u32,
    device: *mut *mut c_void,
    feature_level: *mut D3D_FEATURE_LEVEL,
    immediate_context: *mut *mut c_void,
) -> HRESULT {
    let (shim, descriptor) = bound(HookPoint::CreateDevice);

    let requested = if feature_levels.is_null() {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(feature_levels, feature_level_count as usize) }.to_vec()
    };
    let args = CreateDeviceArgs {
        adapter,
        driver_type,
        software,
        flags,
        feature_levels,
        feature_level_count,
        sdk_version,
        device,
        feature_level,
        immediate_context,
        requested,
        replaced_levels: false,
    };

    let ret = dispatch::intercept(descriptor, shim.sink(), &FeatureLevelRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, CreateDeviceFn>(original) };
        let (levels, count) = args.levels();

        unsafe {
            original(
                args.adapter,
                args.driver_type,
                args.software,
                args.flags,
                levels,
                count,
                args.sdk_version,
                args.device,
                args.feature_level,
                args.immediate_context,
            )
        }
    });

    if ret.is_ok() && !feature_level.is_null() {
        let level = unsafe { *feature_level };
        debug!(
            level = rules::feature_level_name(level.0 as u32).unwrap_or("unknown"),
            "device created"
        );
    }

    ret
}

type CreateTexture2DFn = unsafe extern "system" fn(
    *mut c_void,
    *const D3D11_TEXTURE2D_DESC,
    *const c_void,
    *mut *mut c_void,
) -> HRESULT;

#[derive(Clone)]
struct CreateTexture2DArgs {
    this: *mut c_void,
    desc: *const D3D11_TEXTURE2D_DESC,
    initial_data: *const c_void,
    texture: *mut *mut c_void,

    /// Descriptor copied at entry.
    copy: Option<D3D11_TEXTURE2D_DESC>,
    replaced_desc: bool,
}

impl CreateTexture2DArgs {
    fn desc_ptr(&self) -> *const D3D11_TEXTURE2D_DESC {
        match self.copy {
            Some(ref copy) if self.replaced_desc => ptr::from_ref(copy),
            _ => self.desc,
        }
    }
}

impl CallArgs for CreateTexture2DArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        let Some(ref desc) = self.copy else {
            return vec![Argument::new("desc", Value::Null)];
        };

        let format = desc.Format.0 as u32;
        vec![
            Argument::new("width", Value::U64(desc.Width.into())),
            Argument::new("height", Value::U64(desc.Height.into())),
            Argument::new("mip_levels", Value::U64(desc.MipLevels.into())),
            Argument::new("array_size", Value::U64(desc.ArraySize.into())),
            Argument::new(
                "format",
                rules::format_name(format).map_or(Value::U64(format.into()), Value::name),
            ),
            Argument::new("video", Value::Bool(rules::is_video_format(format))),
            Argument::new("usage", Value::U64(desc.Usage.0 as u64)),
            Argument::new("bind_flags", Value::Hex(desc.BindFlags.into())),
            Argument::new("cpu_access_flags", Value::Hex(desc.CPUAccessFlags.into())),
            Argument::new("misc_flags", Value::Hex(desc.MiscFlags.into())),
            Argument::new("initial_data", Value::ptr(self.initial_data)),
        ]
    }
}

struct SharingRewrite;

impl Rewrite<CreateTexture2DArgs, HRESULT> for SharingRewrite {
    fn rewrite_args(&self, args: &CreateTexture2DArgs) -> Result<Option<CreateTexture2DArgs>, RewriteError> {
        let desc = args.copy.ok_or(RewriteError::NullArgument("desc"))?;

        Ok(rules::texture_misc_flags(desc.MiscFlags).map(|misc_flags| CreateTexture2DArgs {
            copy: Some(D3D11_TEXTURE2D_DESC {
                MiscFlags: misc_flags,
                ..desc
            }),
            replaced_desc: true,
            ..args.clone()
        }))
    }
}

extern "system" fn hooked_create_texture_2d(
    this: *mut c_void,
    desc: *const D3D11_TEXTURE2D_DESC,
    initial_data: *const c_void,
    texture: *mut *mut c_void,
) -> HRESULT {
    let (shim, descriptor) = bound(HookPoint::CreateTexture2D);

    let args = CreateTexture2DArgs {
        this,
        desc,
        initial_data,
        texture,
        copy: (!desc.is_null()).then(|| unsafe { *desc }),
        replaced_desc: false,
    };

    dispatch::intercept(descriptor, shim.sink(), &SharingRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, CreateTexture2DFn>(original) };
        unsafe { original(args.this, args.desc_ptr(), args.initial_data, args.texture) }
    })
}

type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> HRESULT;

struct PresentArgs {
    this: *mut c_void,
    sync_interval: u32,
    flags: u32,
}

impl CallArgs for PresentArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        vec![
            Argument::new("swapchain", Value::ptr(self.this)),
            Argument::new("sync_interval", Value::U64(self.sync_interval.into())),
            Argument::new("flags", Value::Hex(self.flags.into())),
        ]
    }
}

extern "system" fn hooked_present(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT {
    let (shim, descriptor) = bound(HookPoint::Present);
    let args = PresentArgs {
        this,
        sync_interval,
        flags,
    };

    dispatch::intercept(descriptor, shim.sink(), &NoRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, PresentFn>(original) };
        unsafe { original(args.this, args.sync_interval, args.flags) }
    })
}

type DrawIndexedFn = unsafe extern "system" fn(*mut c_void, u32, u32, i32);

struct DrawIndexedArgs {
    this: *mut c_void,
    index_count: u32,
    start_index: u32,
    base_vertex: i32,
}

impl CallArgs for DrawIndexedArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        vec![
            Argument::new("index_count", Value::U64(self.index_count.into())),
            Argument::new("start_index", Value::U64(self.start_index.into())),
            Argument::new("base_vertex", Value::I64(self.base_vertex.into())),
        ]
    }
}

extern "system" fn hooked_draw_indexed(
    this: *mut c_void,
    index_count: u32,
    start_index: u32,
    base_vertex: i32,
) {
    let (shim, descriptor) = bound(HookPoint::DrawIndexed);
    let args = DrawIndexedArgs {
        this,
        index_count,
        start_index,
        base_vertex,
    };

    dispatch::intercept(descriptor, shim.sink(), &NoRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, DrawIndexedFn>(original) };
        unsafe { original(args.this, args.index_count, args.start_index, args.base_vertex) }
    })
}

type DrawFn = unsafe extern "system" fn(*mut c_void, u32, u32);

struct DrawArgs {
    this: *mut c_void,
    vertex_count: u32,
    start_vertex: u32,
}

impl CallArgs for DrawArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        vec![
            Argument::new("vertex_count", Value::U64(self.vertex_count.into())),
            Argument::new("start_vertex", Value::U64(self.start_vertex.into())),
        ]
    }
}

extern "system" fn hooked_draw(this: *mut c_void, vertex_count: u32, start_vertex: u32) {
    let (shim, descriptor) = bound(HookPoint::Draw);
    let args = DrawArgs {
        this,
        vertex_count,
        start_vertex,
    };

    dispatch::intercept(descriptor, shim.sink(), &NoRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, DrawFn>(original) };
        unsafe { original(args.this, args.vertex_count, args.start_vertex) }
    })
}

type MapFn = unsafe extern "system" fn(*mut c_void, *mut c_void, u32, u32, u32, *mut c_void) -> HRESULT;

struct MapArgs {
    this: *mut c_void,
    resource: *mut c_void,
    subresource: u32,
    map_type: u32,
    map_flags: u32,
    mapped: *mut c_void,
}

impl CallArgs for MapArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        vec![
            Argument::new("resource", Value::ptr(self.resource)),
            Argument::new("subresource", Value::U64(self.subresource.into())),
            Argument::new(
                "map_type",
                rules::map_type_name(self.map_type).map_or(Value::U64(self.map_type.into()), Value::name),
            ),
            Argument::new("map_flags", Value::Hex(self.map_flags.into())),
            Argument::new("mapped", Value::ptr(self.mapped)),
        ]
    }
}

extern "system" fn hooked_map(
    this: *mut c_void,
    resource: *mut c_void,
    subresource: u32,
    map_type: u32,
    map_flags: u32,
    mapped: *mut c_void,
) -> HRESULT {
    let (shim, descriptor) = bound(HookPoint::Map);
    let args = MapArgs {
        this,
        resource,
        subresource,
        map_type,
        map_flags,
        mapped,
    };

    dispatch::intercept(descriptor, shim.sink(), &NoRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, MapFn>(original) };
        unsafe {
            original(
                args.this,
                args.resource,
                args.subresource,
                args.map_type,
                args.map_flags,
                args.mapped,
            )
        }
    })
}

type VideoProcessorBltFn = unsafe extern "system" fn(
    *mut c_void,
    *mut c_void,
    *mut c_void,
    u32,
    u32,
    *const D3D11_VIDEO_PROCESSOR_STREAM,
) -> HRESULT;

/// What a `D3D11_VIDEO_PROCESSOR_STREAM` says about its input.
struct StreamSummary {
    enabled: bool,
    has_input: bool,
}

struct VideoProcessorBltArgs {
    this: *mut c_void,
    processor: *mut c_void,
    view: *mut c_void,
    output_frame: u32,
    stream_count: u32,
    streams: *const D3D11_VIDEO_PROCESSOR_STREAM,

    /// Streams summarized at entry.
    summaries: Vec<StreamSummary>,
}

impl CallArgs for VideoProcessorBltArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        let enabled = self
            .summaries
            .iter()
            .map(|stream| Value::Bool(stream.enabled))
            .collect();
        let has_input = self
            .summaries
            .iter()
            .map(|stream| Value::Bool(stream.has_input))
            .collect();

        vec![
            Argument::new("processor", Value::ptr(self.processor)),
            Argument::new("output_view", Value::ptr(self.view)),
            Argument::new("output_frame", Value::U64(self.output_frame.into())),
            Argument::new("stream_count", Value::U64(self.stream_count.into())),
            Argument::new("stream_enabled", Value::List(enabled)),
            Argument::new("stream_has_input", Value::List(has_input)),
        ]
    }
}

extern "system" fn hooked_video_processor_blt(
    this: *mut c_void,
    processor: *mut c_void,
    view: *mut c_void,
    output_frame: u32,
    stream_count: u32,
    streams: *const D3D11_VIDEO_PROCESSOR_STREAM,
) -> HRESULT {
    let (shim, descriptor) = bound(HookPoint::VideoProcessorBlt);

    let summaries = if streams.is_null() {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(streams, stream_count as usize) }
            .iter()
            .map(|stream| StreamSummary {
                enabled: stream.Enable.as_bool(),
                has_input: stream.pInputSurface.is_some(),
            })
            .collect()
    };
    let args = VideoProcessorBltArgs {
        this,
        processor,
        view,
        output_frame,
        stream_count,
        streams,
        summaries,
    };

    let ret = dispatch::intercept(descriptor, shim.sink(), &NoRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, VideoProcessorBltFn>(original) };
        unsafe {
            original(
                args.this,
                args.processor,
                args.view,
                args.output_frame,
                args.stream_count,
                args.streams,
            )
        }
    });

    if ret.is_err() {
        warn!(
            output_frame,
            stream_count,
            hresult = format_args!("{:#010x}", ret.0 as u32),
            "video processor blit failed"
        );
    }

    ret
}

/// Arguments describing a color space, or a single null one.
fn color_space_arguments(space: Option<ColorSpace>) -> ArgumentSnapshot {
    let Some(space) = space else {
        return vec![Argument::new("color_space", Value::Null)];
    };

    vec![
        Argument::new("usage", Value::U64(space.usage.into())),
        Argument::new("rgb_range", Value::name(space.rgb_range_name())),
        Argument::new("ycbcr_matrix", Value::name(space.ycbcr_matrix_name())),
        Argument::new("ycbcr_xvycc", Value::Bool(space.ycbcr_xvycc != 0)),
        Argument::new(
            "nominal_range",
            space
                .nominal_range_name()
                .map_or(Value::U64(space.nominal_range.into()), Value::name),
        ),
    ]
}

fn read_color_space(space: *const D3D11_VIDEO_PROCESSOR_COLOR_SPACE) -> Option<ColorSpace> {
    (!space.is_null()).then(|| ColorSpace::from_bits(unsafe { (*space)._bitfield }))
}

type SetStreamColorSpaceFn = unsafe extern "system" fn(
    *mut c_void,
    *mut c_void,
    u32,
    *const D3D11_VIDEO_PROCESSOR_COLOR_SPACE,
);

struct SetStreamColorSpaceArgs {
    this: *mut c_void,
    processor: *mut c_void,
    stream_index: u32,
    space: *const D3D11_VIDEO_PROCESSOR_COLOR_SPACE,

    /// Color space decoded at entry.
    decoded: Option<ColorSpace>,
}

impl CallArgs for SetStreamColorSpaceArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        let mut arguments = vec![
            Argument::new("processor", Value::ptr(self.processor)),
            Argument::new("stream_index", Value::U64(self.stream_index.into())),
        ];
        arguments.extend(color_space_arguments(self.decoded));
        arguments
    }
}

extern "system" fn hooked_set_stream_color_space(
    this: *mut c_void,
    processor: *mut c_void,
    stream_index: u32,
    space: *const D3D11_VIDEO_PROCESSOR_COLOR_SPACE,
) {
    let (shim, descriptor) = bound(HookPoint::VideoProcessorSetStreamColorSpace);
    let args = SetStreamColorSpaceArgs {
        this,
        processor,
        stream_index,
        space,
        decoded: read_color_space(space),
    };

    dispatch::intercept(descriptor, shim.sink(), &NoRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, SetStreamColorSpaceFn>(original) };
        unsafe { original(args.this, args.processor, args.stream_index, args.space) }
    })
}

type SetOutputColorSpaceFn =
    unsafe extern "system" fn(*mut c_void, *mut c_void, *const D3D11_VIDEO_PROCESSOR_COLOR_SPACE);

struct SetOutputColorSpaceArgs {
    this: *mut c_void,
    processor: *mut c_void,
    space: *const D3D11_VIDEO_PROCESSOR_COLOR_SPACE,
    decoded: Option<ColorSpace>,
}

impl CallArgs for SetOutputColorSpaceArgs {
    fn snapshot(&self) -> ArgumentSnapshot {
        let mut arguments = vec![Argument::new("processor", Value::ptr(self.processor))];
        arguments.extend(color_space_arguments(self.decoded));
        arguments
    }
}

extern "system" fn hooked_set_output_color_space(
    this: *mut c_void,
    processor: *mut c_void,
    space: *const D3D11_VIDEO_PROCESSOR_COLOR_SPACE,
) {
    let (shim, descriptor) = bound(HookPoint::VideoProcessorSetOutputColorSpace);
    let args = SetOutputColorSpaceArgs {
        this,
        processor,
        space,
        decoded: read_color_space(space),
    };

    dispatch::intercept(descriptor, shim.sink(), &NoRewrite, args, |original, args| {
        let original = unsafe { mem::transmute::<usize, SetOutputColorSpaceFn>(original) };
        unsafe { original(args.this, args.processor, args.space) }
    })
}
