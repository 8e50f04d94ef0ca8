use core::ffi::c_void;
use std::ffi::CString;

use anyhow::Context;
use tracing::{debug, warn};
use windows::{
    Win32::{
        Foundation::{HMODULE, HWND},
        Graphics::{
            Direct3D::D3D_DRIVER_TYPE_UNKNOWN,
            Direct3D11::{
                D3D11_CREATE_DEVICE_FLAG, D3D11_CREATE_DEVICE_VIDEO_SUPPORT, D3D11_SDK_VERSION,
                D3D11CreateDeviceAndSwapChain, ID3D11Device, ID3D11DeviceContext,
                ID3D11VideoContext,
            },
            Dxgi::{
                Common::{DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_MODE_DESC, DXGI_SAMPLE_DESC},
                CreateDXGIFactory1, DXGI_SWAP_CHAIN_DESC, DXGI_SWAP_EFFECT_DISCARD,
                DXGI_USAGE_RENDER_TARGET_OUTPUT, IDXGIFactory1, IDXGISwapChain,
            },
        },
        System::LibraryLoader::{GetModuleHandleW, GetProcAddress},
    },
    core::{BOOL, HSTRING, Interface, PCSTR},
};

use crate::registry::{ResolutionError, TargetResolver};

struct Instances {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    swapchain: IDXGISwapChain,

    /// Missing when the adapter has no video support.
    video_context: Option<ID3D11VideoContext>,
}

/// Resolves exports of loaded modules and virtual tables of a throwaway device.
///
/// The device, its immediate context, its video context and a swap chain share
/// their virtual tables with every instance the application creates, including
/// ones created before the shim was loaded.
pub struct DeviceResolver {
    instances: Option<Instances>,
}

impl DeviceResolver {
    /// Create the throwaway device on `hwnd`.
    ///
    /// Without a usable adapter only exports resolve.
    pub fn new(hwnd: HWND) -> Self {
        let instances = create_instances(hwnd)
            .inspect_err(|err| warn!("cannot create dummy device, interface hooks unavailable. err: {err:?}"))
            .ok();

        Self { instances }
    }
}

unsafe impl TargetResolver for DeviceResolver {
    fn export(&self, module: &str, symbol: &str) -> Result<usize, ResolutionError> {
        let not_found = || ResolutionError::SymbolNotFound {
            module: module.to_owned(),
            symbol: symbol.to_owned(),
        };

        let handle = unsafe { GetModuleHandleW(&HSTRING::from(module)) }
            .map_err(|_| ResolutionError::ModuleNotLoaded(module.to_owned()))?;
        let name = CString::new(symbol).map_err(|_| not_found())?;

        let address = unsafe { GetProcAddress(handle, PCSTR(name.as_ptr() as _)) }.ok_or_else(not_found)?;
        Ok(address as usize)
    }

    fn vtable(&self, interface: &str) -> Result<usize, ResolutionError> {
        let unavailable = || ResolutionError::InterfaceUnavailable(interface.to_owned());
        let instances = self.instances.as_ref().ok_or_else(unavailable)?;

        let raw = match interface {
            "ID3D11Device" => instances.device.as_raw(),
            "ID3D11DeviceContext" => instances.context.as_raw(),
            "IDXGISwapChain" => instances.swapchain.as_raw(),
            "ID3D11VideoContext" => {
                instances.video_context.as_ref().ok_or_else(unavailable)?.as_raw()
            }
            _ => return Err(unavailable()),
        };

        // A COM object starts with its virtual table pointer.
        Ok(unsafe { *(raw as *const *const c_void) } as usize)
    }
}

/// Create the device with video support, or without it if the adapter refuses.
fn create_instances(hwnd: HWND) -> anyhow::Result<Instances> {
    let instances = create_device(hwnd, D3D11_CREATE_DEVICE_VIDEO_SUPPORT)
        .inspect_err(|err| debug!("no video capable device, retrying without. err: {err:?}"))
        .or_else(|_| create_device(hwnd, D3D11_CREATE_DEVICE_FLAG(0)))?;

    if instances.video_context.is_none() {
        warn!("no video context, video processor hooks unavailable");
    }
    Ok(instances)
}

#[tracing::instrument]
fn create_device(hwnd: HWND, flags: D3D11_CREATE_DEVICE_FLAG) -> anyhow::Result<Instances> {
    unsafe {
        let factory = CreateDXGIFactory1::<IDXGIFactory1>()?;
        let adapter = factory.EnumAdapters1(0)?;

        let desc = DXGI_SWAP_CHAIN_DESC {
            BufferCount: 1,
            BufferDesc: DXGI_MODE_DESC {
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                ..Default::default()
            },
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                ..Default::default()
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            OutputWindow: hwnd,
            Windowed: BOOL(1),
            SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
            ..Default::default()
        };

        let mut swapchain = None;
        let mut device = None;
        let mut context = None;

        D3D11CreateDeviceAndSwapChain(
            &adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            HMODULE::default(),
            flags,
            None,
            D3D11_SDK_VERSION,
            Some(&desc),
            Some(&mut swapchain),
            Some(&mut device),
            None,
            Some(&mut context),
        )?;

        let context = context.context("immediate context creation failed")?;
        let instances = Instances {
            device: device.context("device creation failed")?,
            video_context: context.cast::<ID3D11VideoContext>().ok(),
            context,
            swapchain: swapchain.context("swap chain creation failed")?,
        };
        debug!(video = instances.video_context.is_some(), "dummy device created");

        Ok(instances)
    }
}
