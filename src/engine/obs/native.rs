//! Direct libobs calls for what the wrapper does not expose
//!
//! Every function takes the wrapper object it operates on by reference, so
//! the native pointer stays alive for the duration of the call.

use std::ffi::{c_char, c_void, CStr, CString};
use std::mem;
use std::path::PathBuf;
use std::ptr;

use libobs as sys;
use libobs_wrapper::data::output::ObsOutputRef;
use libobs_wrapper::data::ObsData;
use libobs_wrapper::scenes::ObsSceneRef;
use libobs_wrapper::sources::ObsSourceRef;
use tracing::warn;

use super::LiveEncoder;
use crate::engine::{
    EngineSignal, MonitoringType, SignalKind, SignalPayload, SignalSender, Subscription,
};

/// Calldata keys a `saved` signal may carry the written file under
const SAVED_PATH_KEYS: &[&str] = &["path", "file", "filename", "output_path"];

struct SignalContext {
    sender: SignalSender,
    subscription: Subscription,
    output: *mut sys::obs_output_t,
}

/// A connected output signal handler. Disconnects on drop.
pub struct SignalConnection {
    output: ObsOutputRef,
    subscription: Subscription,
    context: *mut SignalContext,
}

// SAFETY: the context is only read by the libobs signal thread and freed in
// drop after disconnecting; the sender inside it is Send.
unsafe impl Send for SignalConnection {}

impl SignalConnection {
    pub fn connect(output: &ObsOutputRef, subscription: Subscription, sender: SignalSender) -> Self {
        let raw_output = output.as_ptr().0;
        let context = Box::into_raw(Box::new(SignalContext {
            sender,
            subscription,
            output: raw_output,
        }));
        let name = cstring(subscription.kind.name());
        // SAFETY: the output is kept alive by the cloned ref below and the
        // context lives until drop disconnects it
        unsafe {
            let handler = sys::obs_output_get_signal_handler(raw_output);
            sys::signal_handler_connect(
                handler,
                name.as_ptr(),
                Some(signal_trampoline),
                context as *mut c_void,
            );
        }
        Self {
            output: output.clone(),
            subscription,
            context,
        }
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription
    }
}

impl Drop for SignalConnection {
    fn drop(&mut self) {
        let name = cstring(self.subscription.kind.name());
        // SAFETY: disconnect takes the signal lock, so no callback still holds
        // the context once it returns
        unsafe {
            let handler = sys::obs_output_get_signal_handler(self.output.as_ptr().0);
            sys::signal_handler_disconnect(
                handler,
                name.as_ptr(),
                Some(signal_trampoline),
                self.context as *mut c_void,
            );
            drop(Box::from_raw(self.context));
        }
    }
}

unsafe extern "C" fn signal_trampoline(data: *mut c_void, cd: *mut sys::calldata_t) {
    // SAFETY: data is the SignalContext registered with this callback
    let ctx = &*(data as *const SignalContext);
    let payload = match ctx.subscription.kind {
        SignalKind::Stopped => SignalPayload::Stopped {
            code: calldata_int(cd, "code").unwrap_or(0),
        },
        SignalKind::Saved => SignalPayload::Saved {
            path: saved_path(cd, ctx.output),
        },
    };
    let _ = ctx.sender.send(EngineSignal {
        subscription: ctx.subscription,
        payload,
    });
}

/// Path of the clip a `saved` signal refers to
unsafe fn saved_path(cd: *mut sys::calldata_t, output: *mut sys::obs_output_t) -> Option<PathBuf> {
    if let Some(path) = SAVED_PATH_KEYS.iter().find_map(|key| calldata_string(cd, key)) {
        return Some(PathBuf::from(path));
    }
    call_proc(output, "get_last_replay").1.map(PathBuf::from)
}

/// Call a named procedure on an output, e.g. the replay buffer's `save`
pub fn call_procedure(output: &ObsOutputRef, name: &str) -> bool {
    // SAFETY: the output ref keeps the pointer alive
    unsafe { call_proc(output.as_ptr().0, name).0 }
}

/// Returns success and any `path` the procedure reported
unsafe fn call_proc(output: *mut sys::obs_output_t, name: &str) -> (bool, Option<String>) {
    let name = cstring(name);
    let mut cd: sys::calldata_t = mem::zeroed();
    let handler = sys::obs_output_get_proc_handler(output);
    let ok = sys::proc_handler_call(handler, name.as_ptr(), &mut cd);
    let path = if ok { calldata_string(&mut cd, "path") } else { None };
    if !cd.fixed && !cd.stack.is_null() {
        sys::bfree(cd.stack as *mut c_void);
    }
    (ok, path)
}

unsafe fn calldata_string(cd: *mut sys::calldata_t, key: &str) -> Option<String> {
    let key = cstring(key);
    let mut value: *const c_char = ptr::null();
    let found = sys::calldata_get_data(
        cd,
        key.as_ptr(),
        &mut value as *mut *const c_char as *mut c_void,
        mem::size_of::<*const c_char>(),
    );
    if !found {
        return None;
    }
    to_string(value).filter(|s| !s.is_empty())
}

unsafe fn calldata_int(cd: *mut sys::calldata_t, key: &str) -> Option<i64> {
    let key = cstring(key);
    let mut value: i64 = 0;
    sys::calldata_get_data(
        cd,
        key.as_ptr(),
        &mut value as *mut i64 as *mut c_void,
        mem::size_of::<i64>(),
    )
    .then_some(value)
}

/// Route a source to an output channel, or clear the channel
pub fn set_channel_source(channel: u32, source: Option<&ObsSourceRef>) {
    let source = source.map(|s| s.as_ptr().0).unwrap_or(ptr::null_mut());
    // SAFETY: null clears the channel; libobs takes its own reference otherwise
    unsafe { sys::obs_set_output_source(channel, source) }
}

pub fn set_volume(source: &ObsSourceRef, volume: f32) {
    // SAFETY: live source
    unsafe { sys::obs_source_set_volume(source.as_ptr().0, volume) }
}

pub fn set_enabled(source: &ObsSourceRef, enabled: bool) {
    // SAFETY: live source
    unsafe { sys::obs_source_set_enabled(source.as_ptr().0, enabled) }
}

pub fn set_monitoring(source: &ObsSourceRef, monitoring: MonitoringType) {
    let kind = match monitoring {
        MonitoringType::None => sys::obs_monitoring_type_OBS_MONITORING_TYPE_NONE,
        MonitoringType::MonitorAndOutput => {
            sys::obs_monitoring_type_OBS_MONITORING_TYPE_MONITOR_AND_OUTPUT
        }
    };
    // SAFETY: live source
    unsafe { sys::obs_source_set_monitoring_type(source.as_ptr().0, kind) }
}

pub fn add_filter(source: &ObsSourceRef, kind: &str, name: &str) -> bool {
    let kind_c = cstring(kind);
    let name_c = cstring(name);
    // SAFETY: filter_add takes its own reference, ours is released right after
    unsafe {
        let filter =
            sys::obs_source_create_private(kind_c.as_ptr(), name_c.as_ptr(), ptr::null_mut());
        if filter.is_null() {
            warn!("Filter type {} unavailable", kind);
            return false;
        }
        sys::obs_source_filter_add(source.as_ptr().0, filter);
        sys::obs_source_release(filter);
    }
    true
}

pub fn set_filter_enabled(source: &ObsSourceRef, name: &str, enabled: bool) -> bool {
    let name_c = cstring(name);
    // SAFETY: get_filter_by_name returns a new reference we release
    unsafe {
        let filter = sys::obs_source_get_filter_by_name(source.as_ptr().0, name_c.as_ptr());
        if filter.is_null() {
            return false;
        }
        sys::obs_source_set_enabled(filter, enabled);
        sys::obs_source_release(filter);
    }
    true
}

/// Stretch the scene item showing `source` to `bounds`
pub fn stretch_scene_item(scene: &ObsSceneRef, source: &ObsSourceRef, bounds: (u32, u32)) -> bool {
    // SAFETY: find_source returns an item borrowed from the live scene
    unsafe {
        let name = sys::obs_source_get_name(source.as_ptr().0);
        let item = sys::obs_scene_find_source(scene.as_ptr().0, name);
        if item.is_null() {
            return false;
        }
        let bounds = vec2(bounds.0 as f32, bounds.1 as f32);
        sys::obs_sceneitem_set_bounds_type(item, sys::obs_bounds_type_OBS_BOUNDS_STRETCH);
        sys::obs_sceneitem_set_bounds(item, &bounds);
    }
    true
}

pub fn remove_scene_item(scene: &ObsSceneRef, source: &ObsSourceRef) {
    // SAFETY: find_source returns an item borrowed from the live scene
    unsafe {
        let name = sys::obs_source_get_name(source.as_ptr().0);
        let item = sys::obs_scene_find_source(scene.as_ptr().0, name);
        if !item.is_null() {
            sys::obs_sceneitem_remove(item);
        }
    }
}

/// Identifiers of every registered encoder type
pub fn encoder_types() -> Vec<String> {
    let mut types = Vec::new();
    let mut idx = 0;
    // SAFETY: libobs hands out static identifier strings
    unsafe {
        let mut id: *const c_char = ptr::null();
        while sys::obs_enum_encoder_types(idx, &mut id) {
            if let Some(id) = to_string(id) {
                types.push(id);
            }
            idx += 1;
        }
    }
    types
}

/// Apply settings to a running encoder
pub fn update_encoder(encoder: &LiveEncoder, data: &ObsData) {
    let raw = match encoder {
        LiveEncoder::Video(encoder) => encoder.as_ptr().0,
        LiveEncoder::Audio(encoder) => encoder.as_ptr().0,
    };
    // SAFETY: the Arc keeps the encoder alive; settings are copied
    unsafe { sys::obs_encoder_update(raw, data.as_ptr().0) }
}

pub fn force_stop(output: &ObsOutputRef) {
    // SAFETY: live output
    unsafe { sys::obs_output_force_stop(output.as_ptr().0) }
}

/// Renegotiate the audio pipeline. Only valid while no output is active.
pub fn reset_audio(sample_rate: u32, channels: u32) -> bool {
    // SAFETY: zeroed is a valid starting point for this plain C struct
    let mut oai: sys::obs_audio_info = unsafe { mem::zeroed() };
    oai.samples_per_sec = sample_rate;
    oai.speakers = if channels == 1 {
        sys::speaker_layout_SPEAKERS_MONO
    } else {
        sys::speaker_layout_SPEAKERS_STEREO
    };
    // SAFETY: oai lives across the call
    unsafe { sys::obs_reset_audio(&oai) }
}

unsafe fn to_string(s: *const c_char) -> Option<String> {
    if s.is_null() {
        None
    } else {
        Some(CStr::from_ptr(s).to_string_lossy().into_owned())
    }
}

fn cstring(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

fn vec2(x: f32, y: f32) -> sys::vec2 {
    // SAFETY: vec2 starts with its x and y floats in every layout libobs uses
    unsafe {
        let mut v: sys::vec2 = mem::zeroed();
        let p = &mut v as *mut sys::vec2 as *mut f32;
        *p = x;
        *p.add(1) = y;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstring_strips_interior_nul() {
        assert_eq!(cstring("a\0b").as_bytes(), b"ab");
    }
}
