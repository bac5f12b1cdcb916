//! Windows service control using Service Control Manager (SCM) API

use std::mem;

use anyhow::{Context, Result};
use windows::Win32::System::Services::{
    CloseServiceHandle, ControlService, OpenSCManagerW, OpenServiceW, QueryServiceStatusEx,
    SC_HANDLE, SC_MANAGER_CONNECT, SC_STATUS_PROCESS_INFO, SERVICE_CONTROL_STOP,
    SERVICE_QUERY_STATUS, SERVICE_RUNNING, SERVICE_START, SERVICE_STATUS,
    SERVICE_STATUS_PROCESS, SERVICE_STOP, SERVICE_STOPPED, StartServiceW,
};
use windows::core::PCWSTR;

use super::ServiceRunState;

/// RAII wrapper for SC_HANDLE (Service Control Manager handle)
struct ScManagerHandle(SC_HANDLE);

impl ScManagerHandle {
    fn new() -> Result<Self> {
        let handle = unsafe { OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), SC_MANAGER_CONNECT) }
            .context("Failed to open Service Control Manager")?;

        Ok(ScManagerHandle(handle))
    }

    fn handle(&self) -> SC_HANDLE {
        self.0
    }
}

impl Drop for ScManagerHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseServiceHandle(self.0);
            }
        }
    }
}

/// RAII wrapper for SC_HANDLE (Service handle)
struct ServiceHandle(SC_HANDLE);

impl ServiceHandle {
    fn handle(&self) -> SC_HANDLE {
        self.0
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseServiceHandle(self.0);
            }
        }
    }
}

/// Open a service with the specified access rights
fn open_service(sc_manager: &ScManagerHandle, service: &str, access: u32) -> Result<ServiceHandle> {
    let service_name: Vec<u16> = service.encode_utf16().chain(Some(0)).collect();

    let handle = unsafe {
        OpenServiceW(sc_manager.handle(), PCWSTR(service_name.as_ptr()), access)
    }
    .with_context(|| format!("Failed to open service: {service}"))?;

    Ok(ServiceHandle(handle))
}

/// Query the service state via QueryServiceStatusEx
pub fn query_state(service: &str) -> Result<ServiceRunState> {
    let sc_manager = ScManagerHandle::new()
        .context("Failed to open Service Control Manager for status check")?;

    let handle = open_service(&sc_manager, service, SERVICE_QUERY_STATUS)
        .context("Failed to open service for status check")?;

    let mut status: SERVICE_STATUS_PROCESS = unsafe { mem::zeroed() };
    let mut bytes_needed: u32 = 0;

    let buffer = unsafe {
        std::slice::from_raw_parts_mut(
            &mut status as *mut SERVICE_STATUS_PROCESS as *mut u8,
            mem::size_of::<SERVICE_STATUS_PROCESS>(),
        )
    };

    unsafe {
        QueryServiceStatusEx(
            handle.handle(),
            SC_STATUS_PROCESS_INFO,
            Some(buffer),
            &mut bytes_needed,
        )
    }
    .context("Failed to query service status")?;

    let state = if status.dwCurrentState == SERVICE_RUNNING {
        ServiceRunState::Running
    } else if status.dwCurrentState == SERVICE_STOPPED {
        ServiceRunState::Stopped
    } else {
        // START_PENDING, STOP_PENDING, PAUSED, ...
        ServiceRunState::Unknown
    };

    Ok(state)
}

/// Start the service via StartServiceW
pub fn start_service(service: &str) -> Result<()> {
    let sc_manager = ScManagerHandle::new()
        .context("Failed to open Service Control Manager for start")?;

    let handle = open_service(&sc_manager, service, SERVICE_START)
        .context("Failed to open service for start")?;

    unsafe { StartServiceW(handle.handle(), None) }
        .with_context(|| format!("Failed to start service {service}"))?;

    Ok(())
}

/// Stop the service via ControlService
pub fn stop_service(service: &str) -> Result<()> {
    let sc_manager = ScManagerHandle::new()
        .context("Failed to open Service Control Manager for stop")?;

    let handle = open_service(&sc_manager, service, SERVICE_STOP)
        .context("Failed to open service for stop")?;

    let mut status: SERVICE_STATUS = unsafe { mem::zeroed() };

    unsafe { ControlService(handle.handle(), SERVICE_CONTROL_STOP, &mut status) }
        .with_context(|| format!("Failed to stop service {service}"))?;

    Ok(())
}
