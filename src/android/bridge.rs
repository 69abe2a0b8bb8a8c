//! JNI function exports for Android integration
//!
//! These functions are called from Kotlin via JNI. The service pushes frames
//! with `submitFrame`, dispatches whatever `pollGesture` hands back and
//! reports the result through `completeGesture`. Runs are controlled with
//! `start`, `stop` and `getStatus`.

use jni::objects::{JByteArray, JClass, JObject, JString};
use jni::sys::{jboolean, jint, jlong, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;

use crate::config::Settings;
use crate::vision::Frame;
use crate::{get_pilot, init_pilot, Pilot};

/// Initialize the automation engine
///
/// Called once when the Android service starts. `config_json` may be null,
/// in which case default settings are used.
#[no_mangle]
pub extern "system" fn Java_io_framepilot_PilotCore_init<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    config_json: JString<'local>,
) -> jboolean {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Debug)
            .with_tag("FramePilot"),
    );

    if get_pilot().is_some() {
        log::info!("Engine already initialized");
        return JNI_TRUE;
    }

    log::info!("Initializing automation engine");

    let settings = if config_json.is_null() {
        Settings::default()
    } else {
        let Some(config) = read_string(&mut env, &config_json) else {
            return JNI_FALSE;
        };
        match Settings::from_json(&config) {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("Invalid settings: {}", e);
                return JNI_FALSE;
            }
        }
    };

    match Pilot::load(settings) {
        Ok(pilot) => {
            init_pilot(pilot);
            log::info!("Engine initialized successfully");
            JNI_TRUE
        }
        Err(e) => {
            log::error!("Failed to initialize engine: {}", e);
            JNI_FALSE
        }
    }
}

/// Start a run of the given step graph definition
#[no_mangle]
pub extern "system" fn Java_io_framepilot_PilotCore_start<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    graph_json: JString<'local>,
) -> jboolean {
    let Some(pilot) = get_pilot() else {
        log::error!("Engine not initialized");
        return JNI_FALSE;
    };

    let Some(definition) = read_string(&mut env, &graph_json) else {
        return JNI_FALSE;
    };

    match pilot.controller.start_json(&definition) {
        Ok(handle) => {
            log::info!("Run {} accepted", handle.id());
            JNI_TRUE
        }
        Err(e) => {
            log::error!("Run rejected: {}", e);
            JNI_FALSE
        }
    }
}

/// Request the current run to stop. Returns immediately.
#[no_mangle]
pub extern "system" fn Java_io_framepilot_PilotCore_stop<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
) {
    if let Some(pilot) = get_pilot() {
        pilot.controller.stop();
    }
}

/// Current status as JSON: `{ state, current_step_id, attempt_count, reason? }`
#[no_mangle]
pub extern "system" fn Java_io_framepilot_PilotCore_getStatus<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> JString<'local> {
    let status = get_pilot()
        .map(|pilot| pilot.controller.get_status())
        .unwrap_or_default();

    let json = serde_json::to_string(&status).unwrap_or_else(|_| "{}".to_string());
    new_string(&mut env, &json)
}

/// Push the latest screen frame (tightly packed RGBA)
#[no_mangle]
pub extern "system" fn Java_io_framepilot_PilotCore_submitFrame<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    frame_data: JByteArray<'local>,
    width: jint,
    height: jint,
) -> jboolean {
    let Some(pilot) = get_pilot() else {
        return JNI_FALSE;
    };

    let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
        log::error!("Invalid frame size {}x{}", width, height);
        return JNI_FALSE;
    };

    let bytes = match env.convert_byte_array(frame_data) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Failed to convert frame data: {}", e);
            return JNI_FALSE;
        }
    };

    match Frame::from_rgba(&bytes, width, height) {
        Ok(frame) => {
            pilot.frames.submit(frame);
            JNI_TRUE
        }
        Err(e) => {
            log::error!("Rejected frame: {}", e);
            JNI_FALSE
        }
    }
}

/// Next gesture to dispatch as JSON (`{ id, type, ... }`), or an empty
/// string when none is pending
#[no_mangle]
pub extern "system" fn Java_io_framepilot_PilotCore_pollGesture<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> JString<'local> {
    let json = get_pilot()
        .and_then(|pilot| pilot.gestures.poll())
        .and_then(|dispatch| serde_json::to_string(&dispatch).ok())
        .unwrap_or_default();

    new_string(&mut env, &json)
}

/// Report whether the gesture `id` handed out by `pollGesture` was dispatched.
///
/// Must be called for every polled gesture; the engine treats a gesture that
/// is never confirmed as a failed action.
#[no_mangle]
pub extern "system" fn Java_io_framepilot_PilotCore_completeGesture<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
    id: jlong,
    dispatched: jboolean,
) -> jboolean {
    let Some(pilot) = get_pilot() else {
        return JNI_FALSE;
    };
    let Ok(id) = u64::try_from(id) else {
        log::error!("Invalid gesture id {}", id);
        return JNI_FALSE;
    };

    if pilot.gestures.complete(id, dispatched != JNI_FALSE) {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

fn read_string(env: &mut JNIEnv, value: &JString) -> Option<String> {
    match env.get_string(value) {
        Ok(s) => Some(s.into()),
        Err(e) => {
            log::error!("Failed to read string argument: {}", e);
            None
        }
    }
}

fn new_string<'local>(env: &mut JNIEnv<'local>, value: &str) -> JString<'local> {
    match env.new_string(value) {
        Ok(s) => s,
        Err(e) => {
            log::error!("Failed to create Java string: {}", e);
            JString::from(JObject::null())
        }
    }
}
