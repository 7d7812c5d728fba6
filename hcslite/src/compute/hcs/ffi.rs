//! Raw bindings to vmcompute.dll.
//!
//! Hand-declared `extern "system"` imports for the compute-service entry
//! points the shim uses, plus the string/HRESULT plumbing around them. All
//! unsafe stays inside this module; `super` only sees safe wrappers.

#![allow(non_snake_case)]

use hcslite_shared::{HcsliteError, HcsliteResult};
use std::ffi::c_void;
use std::os::windows::ffi::{OsStrExt, OsStringExt};

pub type HcsSystemHandle = *mut c_void;
pub type HcsProcessHandle = *mut c_void;
pub type HcsCallbackHandle = *mut c_void;
pub type Pwstr = *mut u16;
pub type Pcwstr = *const u16;

/// Notification callback: (type, context, status, data).
pub type NotificationCallback =
    unsafe extern "system" fn(u32, *mut c_void, i32, Pcwstr);

// Notification type codes emitted by the compute service.
pub const HCS_NOTIFICATION_SYSTEM_EXITED: u32 = 0x0000_0001;
pub const HCS_NOTIFICATION_SYSTEM_CREATE_COMPLETED: u32 = 0x0000_0002;
pub const HCS_NOTIFICATION_SYSTEM_START_COMPLETED: u32 = 0x0000_0003;
pub const HCS_NOTIFICATION_PROCESS_EXITED: u32 = 0x0001_0000;
pub const HCS_NOTIFICATION_SERVICE_DISCONNECT: u32 = 0x0100_0000;

/// The operation is executing asynchronously; completion arrives as a
/// notification.
pub const E_PENDING: i32 = 0x8000_000Au32 as i32;

#[repr(C)]
pub struct HcsProcessInformation {
    pub process_id: u32,
    pub reserved: u32,
    pub std_input: *mut c_void,
    pub std_output: *mut c_void,
    pub std_error: *mut c_void,
}

#[link(name = "vmcompute")]
extern "system" {
    fn HcsCreateComputeSystem(
        id: Pcwstr,
        configuration: Pcwstr,
        identity: *mut c_void,
        computeSystem: *mut HcsSystemHandle,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsOpenComputeSystem(
        id: Pcwstr,
        computeSystem: *mut HcsSystemHandle,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsCloseComputeSystem(computeSystem: HcsSystemHandle) -> i32;
    fn HcsStartComputeSystem(
        computeSystem: HcsSystemHandle,
        options: Pcwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsShutdownComputeSystem(
        computeSystem: HcsSystemHandle,
        options: Pcwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsTerminateComputeSystem(
        computeSystem: HcsSystemHandle,
        options: Pcwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsGetComputeSystemProperties(
        computeSystem: HcsSystemHandle,
        propertyQuery: Pcwstr,
        properties: *mut Pwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsModifyComputeSystem(
        computeSystem: HcsSystemHandle,
        configuration: Pcwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsRegisterComputeSystemCallback(
        computeSystem: HcsSystemHandle,
        callback: NotificationCallback,
        context: *mut c_void,
        callbackHandle: *mut HcsCallbackHandle,
    ) -> i32;
    fn HcsUnregisterComputeSystemCallback(callbackHandle: HcsCallbackHandle) -> i32;
    fn HcsCreateProcess(
        computeSystem: HcsSystemHandle,
        processParameters: Pcwstr,
        processInformation: *mut HcsProcessInformation,
        process: *mut HcsProcessHandle,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsCloseProcess(process: HcsProcessHandle) -> i32;
    fn HcsTerminateProcess(process: HcsProcessHandle, result: *mut Pwstr) -> i32;
    fn HcsSignalProcess(
        process: HcsProcessHandle,
        options: Pcwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsGetProcessProperties(
        process: HcsProcessHandle,
        properties: *mut Pwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsModifyProcess(
        process: HcsProcessHandle,
        settings: Pcwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsRegisterProcessCallback(
        process: HcsProcessHandle,
        callback: NotificationCallback,
        context: *mut c_void,
        callbackHandle: *mut HcsCallbackHandle,
    ) -> i32;
    fn HcsUnregisterProcessCallback(callbackHandle: HcsCallbackHandle) -> i32;
}

fn wide(s: &str) -> Vec<u16> {
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

/// Copy and free a service-allocated wide string.
pub unsafe fn take_wide_string(ptr: Pwstr) -> Option<String> {
    use windows_sys::Win32::Foundation::LocalFree;

    if ptr.is_null() {
        return None;
    }
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    let text = std::ffi::OsString::from_wide(std::slice::from_raw_parts(ptr, len))
        .to_string_lossy()
        .into_owned();
    LocalFree(ptr as *mut c_void);
    Some(text)
}

fn check(hresult: i32, result: Pwstr, what: &str) -> HcsliteResult<()> {
    let detail = unsafe { take_wide_string(result) };
    // Pending is success: completion is delivered as a notification.
    if hresult >= 0 || hresult == E_PENDING {
        return Ok(());
    }
    Err(HcsliteError::compute(
        hresult,
        detail.unwrap_or_else(|| what.to_string()),
    ))
}

pub fn create_compute_system(id: &str, configuration: &str) -> HcsliteResult<HcsSystemHandle> {
    let id_w = wide(id);
    let config_w = wide(configuration);
    let mut handle: HcsSystemHandle = std::ptr::null_mut();
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe {
        HcsCreateComputeSystem(
            id_w.as_ptr(),
            config_w.as_ptr(),
            std::ptr::null_mut(),
            &mut handle,
            &mut result,
        )
    };
    check(hr, result, "create compute system")?;
    Ok(handle)
}

pub fn open_compute_system(id: &str) -> HcsliteResult<HcsSystemHandle> {
    let id_w = wide(id);
    let mut handle: HcsSystemHandle = std::ptr::null_mut();
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsOpenComputeSystem(id_w.as_ptr(), &mut handle, &mut result) };
    check(hr, result, "open compute system")?;
    Ok(handle)
}

pub fn close_compute_system(handle: HcsSystemHandle) {
    unsafe {
        HcsCloseComputeSystem(handle);
    }
}

pub fn start_compute_system(handle: HcsSystemHandle) -> HcsliteResult<()> {
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsStartComputeSystem(handle, std::ptr::null(), &mut result) };
    check(hr, result, "start compute system")
}

pub fn shutdown_compute_system(handle: HcsSystemHandle) -> HcsliteResult<()> {
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsShutdownComputeSystem(handle, std::ptr::null(), &mut result) };
    check(hr, result, "shutdown compute system")
}

pub fn terminate_compute_system(handle: HcsSystemHandle) -> HcsliteResult<()> {
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsTerminateComputeSystem(handle, std::ptr::null(), &mut result) };
    check(hr, result, "terminate compute system")
}

pub fn get_compute_system_properties(
    handle: HcsSystemHandle,
    query: &str,
) -> HcsliteResult<String> {
    let query_w = wide(query);
    let mut properties: Pwstr = std::ptr::null_mut();
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe {
        HcsGetComputeSystemProperties(handle, query_w.as_ptr(), &mut properties, &mut result)
    };
    check(hr, result, "query compute system properties")?;
    Ok(unsafe { take_wide_string(properties) }.unwrap_or_default())
}

pub fn modify_compute_system(handle: HcsSystemHandle, configuration: &str) -> HcsliteResult<()> {
    let config_w = wide(configuration);
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsModifyComputeSystem(handle, config_w.as_ptr(), &mut result) };
    check(hr, result, "modify compute system")
}

pub fn register_compute_system_callback(
    handle: HcsSystemHandle,
    callback: NotificationCallback,
    context: u64,
) -> HcsliteResult<HcsCallbackHandle> {
    let mut callback_handle: HcsCallbackHandle = std::ptr::null_mut();
    let hr = unsafe {
        HcsRegisterComputeSystemCallback(
            handle,
            callback,
            context as usize as *mut c_void,
            &mut callback_handle,
        )
    };
    if hr < 0 {
        return Err(HcsliteError::compute(hr, "register system callback"));
    }
    Ok(callback_handle)
}

pub fn unregister_compute_system_callback(handle: HcsCallbackHandle) {
    unsafe {
        HcsUnregisterComputeSystemCallback(handle);
    }
}

pub fn create_process(
    system: HcsSystemHandle,
    parameters: &str,
) -> HcsliteResult<(HcsProcessHandle, HcsProcessInformation)> {
    let params_w = wide(parameters);
    let mut info = HcsProcessInformation {
        process_id: 0,
        reserved: 0,
        std_input: std::ptr::null_mut(),
        std_output: std::ptr::null_mut(),
        std_error: std::ptr::null_mut(),
    };
    let mut process: HcsProcessHandle = std::ptr::null_mut();
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe {
        HcsCreateProcess(system, params_w.as_ptr(), &mut info, &mut process, &mut result)
    };
    check(hr, result, "create process")?;
    Ok((process, info))
}

pub fn close_process(handle: HcsProcessHandle) {
    unsafe {
        HcsCloseProcess(handle);
    }
}

pub fn terminate_process(handle: HcsProcessHandle) -> HcsliteResult<()> {
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsTerminateProcess(handle, &mut result) };
    check(hr, result, "terminate process")
}

pub fn signal_process(handle: HcsProcessHandle, options: &str) -> HcsliteResult<()> {
    let options_w = wide(options);
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsSignalProcess(handle, options_w.as_ptr(), &mut result) };
    check(hr, result, "signal process")
}

pub fn get_process_properties(handle: HcsProcessHandle) -> HcsliteResult<String> {
    let mut properties: Pwstr = std::ptr::null_mut();
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsGetProcessProperties(handle, &mut properties, &mut result) };
    check(hr, result, "query process properties")?;
    Ok(unsafe { take_wide_string(properties) }.unwrap_or_default())
}

pub fn modify_process(handle: HcsProcessHandle, settings: &str) -> HcsliteResult<()> {
    let settings_w = wide(settings);
    let mut result: Pwstr = std::ptr::null_mut();
    let hr = unsafe { HcsModifyProcess(handle, settings_w.as_ptr(), &mut result) };
    check(hr, result, "modify process")
}

pub fn register_process_callback(
    handle: HcsProcessHandle,
    callback: NotificationCallback,
    context: u64,
) -> HcsliteResult<HcsCallbackHandle> {
    let mut callback_handle: HcsCallbackHandle = std::ptr::null_mut();
    let hr = unsafe {
        HcsRegisterProcessCallback(
            handle,
            callback,
            context as usize as *mut c_void,
            &mut callback_handle,
        )
    };
    if hr < 0 {
        return Err(HcsliteError::compute(hr, "register process callback"));
    }
    Ok(callback_handle)
}

pub fn unregister_process_callback(handle: HcsCallbackHandle) {
    unsafe {
        HcsUnregisterProcessCallback(handle);
    }
}
