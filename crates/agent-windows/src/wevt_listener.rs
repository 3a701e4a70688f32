// WEVTAPI plumbing: pull-model subscription plus reverse back-scan.
//
// Strict cfg(target_os = "windows") boundaries so the workspace
// compiles everywhere; non-Windows builds get explicit errors.
//
// The pull model (EvtSubscribe with a signal event, drained by EvtNext)
// is used instead of the callback model: all parsing, dedup, and queue
// mutation stays on the main thread, and the wait timeout doubles as
// the safety-net drain cadence.

use crate::error::AgentError;

/// Result of waiting on the subscription signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// New matching events were written; drain now.
    Signaled,
    /// Nothing signaled within the timeout; drain anyway as a safety
    /// net — some event-log builds never fire the signal even though
    /// EvtNext returns events fine.
    TimedOut,
    /// The wait itself failed.
    Failed,
}

/// Whether the back-scan should keep reading older events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// Events fetched per EvtNext call.
const READ_BATCH: usize = 50;

/// Live pull-model subscription on the Security channel.
pub struct WevtListener {
    #[cfg(target_os = "windows")]
    inner: imp::Subscription,
}

impl WevtListener {
    /// Subscribe to future events matching `event_id` on the Security
    /// channel.
    pub fn subscribe(event_id: u32) -> Result<Self, AgentError> {
        #[cfg(target_os = "windows")]
        {
            Ok(Self {
                inner: imp::Subscription::create(event_id)?,
            })
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = event_id;
            Err(AgentError::Subscription(
                "event log subscription requires Windows".to_string(),
            ))
        }
    }

    /// Block until the signal fires or `timeout_ms` elapses.
    pub fn wait(&self, timeout_ms: u32) -> WaitOutcome {
        #[cfg(target_os = "windows")]
        {
            self.inner.wait(timeout_ms)
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = timeout_ms;
            WaitOutcome::Failed
        }
    }

    /// Reset the manual-reset signal. Called before draining so events
    /// arriving mid-drain re-signal instead of being lost.
    pub fn reset_signal(&self) {
        #[cfg(target_os = "windows")]
        self.inner.reset_signal();
    }

    /// Drain all buffered events, returning their rendered XML.
    pub fn drain(&self) -> Vec<String> {
        #[cfg(target_os = "windows")]
        {
            self.inner.drain()
        }

        #[cfg(not(target_os = "windows"))]
        {
            Vec::new()
        }
    }
}

/// Reverse-chronological snapshot read of existing events. `on_batch`
/// receives each rendered batch (newest first) and returns whether to
/// keep scanning — once an entire batch is already known, everything
/// older is guaranteed known too.
pub fn back_scan<F>(event_id: u32, on_batch: F) -> Result<(), AgentError>
where
    F: FnMut(Vec<String>) -> ScanControl,
{
    #[cfg(target_os = "windows")]
    {
        imp::back_scan(event_id, on_batch)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let _ = (event_id, on_batch);
        Err(AgentError::Query(
            "event log query requires Windows".to_string(),
        ))
    }
}

fn channel_query(event_id: u32) -> String {
    format!("*[System[EventID={}]]", event_id)
}

#[cfg(target_os = "windows")]
mod imp {
    use super::*;
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{
        CloseHandle, ERROR_INSUFFICIENT_BUFFER, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
    };
    use windows::Win32::Security::SECURITY_ATTRIBUTES;
    use windows::Win32::System::EventLog::{
        EvtClose, EvtNext, EvtQuery, EvtQueryChannelPath, EvtQueryReverseDirection,
        EvtRender, EvtRenderEventXml, EvtSubscribe, EvtSubscribeToFutureEvents, EVT_HANDLE,
    };
    use windows::Win32::System::Threading::{
        CreateEventW, ResetEvent, WaitForSingleObject, INFINITE,
    };

    const CHANNEL: &str = "Security";

    /// RAII guard for an EVT_HANDLE; EvtClose exactly once on drop.
    struct EvtHandleGuard(Option<EVT_HANDLE>);

    impl EvtHandleGuard {
        fn from_raw(handle: EVT_HANDLE) -> Result<Self, AgentError> {
            if handle.is_invalid() {
                return Err(AgentError::Subscription("invalid EVT_HANDLE".to_string()));
            }
            Ok(Self(Some(handle)))
        }

        fn handle(&self) -> EVT_HANDLE {
            self.0.unwrap_or_default()
        }
    }

    impl Drop for EvtHandleGuard {
        fn drop(&mut self) {
            if let Some(handle) = self.0.take() {
                if !handle.is_invalid() {
                    unsafe {
                        let _ = EvtClose(handle);
                    }
                }
            }
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        OsStr::new(s)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    pub struct Subscription {
        signal: HANDLE,
        subscription: EvtHandleGuard,
    }

    impl Subscription {
        pub fn create(event_id: u32) -> Result<Self, AgentError> {
            let query = to_wide(&channel_query(event_id));
            let channel = to_wide(CHANNEL);

            // Manual-reset event: stays signaled until explicitly reset,
            // which avoids the race where an auto-reset event is consumed
            // before the drain runs. No security descriptor: the handle
            // never leaves this process.
            let security: Option<*const SECURITY_ATTRIBUTES> = None;
            let signal = unsafe { CreateEventW(security, true, false, None) }
                .map_err(|e| AgentError::Subscription(format!("CreateEventW failed: {:?}", e)))?;

            let raw = unsafe {
                EvtSubscribe(
                    None,
                    signal,
                    PCWSTR(channel.as_ptr()),
                    PCWSTR(query.as_ptr()),
                    None,
                    None,
                    None,
                    EvtSubscribeToFutureEvents.0,
                )
            }
            .map_err(|e| {
                unsafe {
                    let _ = CloseHandle(signal);
                }
                AgentError::Subscription(format!("EvtSubscribe failed: {:?}", e))
            })?;

            let subscription = EvtHandleGuard::from_raw(raw).map_err(|e| {
                unsafe {
                    let _ = CloseHandle(signal);
                }
                e
            })?;

            Ok(Self {
                signal,
                subscription,
            })
        }

        pub fn wait(&self, timeout_ms: u32) -> WaitOutcome {
            let result = unsafe { WaitForSingleObject(self.signal, timeout_ms) };
            if result == WAIT_OBJECT_0 {
                WaitOutcome::Signaled
            } else if result == WAIT_TIMEOUT {
                WaitOutcome::TimedOut
            } else {
                WaitOutcome::Failed
            }
        }

        pub fn reset_signal(&self) {
            unsafe {
                let _ = ResetEvent(self.signal);
            }
        }

        pub fn drain(&self) -> Vec<String> {
            // Timeout 0: return immediately with whatever is buffered.
            // INFINITE on a subscription handle would block forever once
            // the buffered events are consumed.
            read_all(self.subscription.handle(), 0, |_| ScanControl::Continue)
        }
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.signal);
            }
        }
    }

    pub fn back_scan<F>(event_id: u32, mut on_batch: F) -> Result<(), AgentError>
    where
        F: FnMut(Vec<String>) -> ScanControl,
    {
        let query = to_wide(&channel_query(event_id));
        let channel = to_wide(CHANNEL);

        let raw = unsafe {
            EvtQuery(
                None,
                PCWSTR(channel.as_ptr()),
                PCWSTR(query.as_ptr()),
                EvtQueryChannelPath.0 | EvtQueryReverseDirection.0,
            )
        }
        .map_err(|e| AgentError::Query(format!("EvtQuery failed: {:?}", e)))?;
        let guard = EvtHandleGuard::from_raw(raw)?;

        read_all(guard.handle(), INFINITE, &mut on_batch);
        Ok(())
    }

    /// Repeated bounded EvtNext reads until the handle is exhausted or
    /// the batch callback stops the read. Returns all rendered XML.
    fn read_all<F>(handle: EVT_HANDLE, timeout_ms: u32, mut on_batch: F) -> Vec<String>
    where
        F: FnMut(Vec<String>) -> ScanControl,
    {
        let mut all = Vec::new();

        loop {
            let mut event_handles: [isize; READ_BATCH] = [0; READ_BATCH];
            let mut returned = 0u32;

            let next = unsafe {
                EvtNext(
                    handle,
                    &mut event_handles,
                    timeout_ms,
                    0,
                    &mut returned,
                )
            };
            if next.is_err() || returned == 0 {
                break;
            }

            let mut batch = Vec::with_capacity(returned as usize);
            for &raw in event_handles.iter().take(returned as usize) {
                let evt = EVT_HANDLE(raw);
                if evt.is_invalid() {
                    continue;
                }

                match render_event_xml(evt) {
                    Ok(xml) => batch.push(xml),
                    Err(e) => tracing::warn!("failed to render event XML: {}", e),
                }

                unsafe {
                    let _ = EvtClose(evt);
                }
            }

            let control = on_batch(batch.clone());
            all.extend(batch);

            if control == ScanControl::Stop || (returned as usize) < READ_BATCH {
                break;
            }
        }

        all
    }

    /// UTF-16 units in the initial render buffer. A typical 4625 event
    /// renders to ~2 KB of XML, so the first pass usually fits.
    const RENDER_BUFFER_START: usize = 4096;

    /// Render one event as XML. Rather than probing for the size up
    /// front, render optimistically into a fixed buffer and regrow to
    /// the byte count EvtRender reports when it does not fit; the
    /// second pass is then exact.
    fn render_event_xml(event_handle: EVT_HANDLE) -> Result<String, String> {
        let mut buffer = vec![0u16; RENDER_BUFFER_START];
        let mut used_bytes = 0u32;

        for _ in 0..2 {
            let rendered = unsafe {
                EvtRender(
                    None,
                    event_handle,
                    EvtRenderEventXml.0,
                    (buffer.len() * 2) as u32,
                    Some(buffer.as_mut_ptr() as *mut _),
                    &mut used_bytes,
                    std::ptr::null_mut(),
                )
            };

            match rendered {
                Ok(()) => {
                    let end = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
                    return Ok(String::from_utf16_lossy(&buffer[..end]));
                }
                Err(e) if e.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() => {
                    // used_bytes now holds the size the render needs.
                    buffer.resize(used_bytes as usize / 2 + 1, 0);
                }
                Err(e) => return Err(format!("could not render event: {:?}", e)),
            }
        }

        Err(format!(
            "render did not fit its reported size of {} bytes",
            used_bytes
        ))
    }
}
