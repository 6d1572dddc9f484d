//! Exported `extern "C"` functions.

use std::ffi::{c_char, c_int, CStr, CString};
use std::slice;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use publisher_engine::{build_info, selected_backend, BackendKind};
use publisher_types::{ErrorKind, PublishError, StreamConfig, StreamState};

use crate::{c_string, query, reject, with_publisher};

/// Stream configuration as laid out by C callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RtmpConfig {
    pub width: c_int,
    pub height: c_int,
    pub fps: c_int,
    pub bitrate_kbps: c_int,
    pub keyframe_interval: c_int,
    pub audio_sample_rate: c_int,
    pub audio_channels: c_int,
    pub audio_bitrate_kbps: c_int,
}

impl RtmpConfig {
    fn to_stream_config(self) -> Result<StreamConfig, PublishError> {
        StreamConfig::from_raw(
            self.width,
            self.height,
            self.fps,
            self.bitrate_kbps,
            self.keyframe_interval,
            self.audio_sample_rate,
            self.audio_channels,
            self.audio_bitrate_kbps,
        )
    }
}

static BUILD_INFO: Lazy<CString> =
    Lazy::new(|| c_string(&build_info(selected_backend() == BackendKind::Stub)));

fn init_with(raw: RtmpConfig) -> c_int {
    let config = match raw.to_stream_config() {
        Ok(config) => config,
        Err(e) => return reject("init", e),
    };
    with_publisher("init", ErrorKind::InitFailed, |publisher| {
        publisher.init(config)
    })
}

/// Initialize the encoder session from `config`.
///
/// Any previous session is torn down first. Optional fields that are zero
/// or negative take their defaults.
///
/// # Safety
///
/// `config` must be null or point to a valid `RtmpConfig`.
#[no_mangle]
pub unsafe extern "C" fn rtmp_init(config: *const RtmpConfig) -> c_int {
    if config.is_null() {
        warn!("rtmp_init called with a null config");
        return reject("init", PublishError::InvalidParams("config is null".into()));
    }
    init_with(*config)
}

/// [`rtmp_init`] with the fields passed by value.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn rtmp_init_simple(
    width: c_int,
    height: c_int,
    fps: c_int,
    bitrate_kbps: c_int,
    keyframe_interval: c_int,
    audio_sample_rate: c_int,
    audio_channels: c_int,
    audio_bitrate_kbps: c_int,
) -> c_int {
    init_with(RtmpConfig {
        width,
        height,
        fps,
        bitrate_kbps,
        keyframe_interval,
        audio_sample_rate,
        audio_channels,
        audio_bitrate_kbps,
    })
}

/// Connect to an `rtmp://`, `rtmps://` or `file://` URL.
///
/// # Safety
///
/// `url` must be null or a NUL-terminated string valid for the call.
#[no_mangle]
pub unsafe extern "C" fn rtmp_connect(url: *const c_char) -> c_int {
    if url.is_null() {
        warn!("rtmp_connect called with a null url");
        return reject("connect", PublishError::InvalidParams("url is null".into()));
    }
    let url = match CStr::from_ptr(url).to_str() {
        Ok(url) => url.to_owned(),
        Err(_) => {
            return reject(
                "connect",
                PublishError::InvalidParams("url is not valid UTF-8".into()),
            )
        }
    };
    with_publisher("connect", ErrorKind::ConnectFailed, |publisher| {
        publisher.connect(&url)
    })
}

#[no_mangle]
pub extern "C" fn rtmp_start_streaming() -> c_int {
    with_publisher("start_streaming", ErrorKind::InitFailed, |publisher| {
        publisher.start_streaming()
    })
}

/// Encode and send one RGBA frame of `data_size` bytes stamped `pts` ms.
///
/// # Safety
///
/// `rgba_data` must be null or valid for reads of `data_size` bytes for the
/// duration of the call.
#[no_mangle]
pub unsafe extern "C" fn rtmp_send_video_frame(
    rgba_data: *const u8,
    data_size: c_int,
    pts: i64,
) -> c_int {
    let len = match usize::try_from(data_size) {
        Ok(len) => len,
        Err(_) => {
            return reject(
                "send_video_frame",
                PublishError::InvalidParams(format!("negative data size {}", data_size)),
            )
        }
    };
    let frame: &[u8] = if rgba_data.is_null() {
        if len != 0 {
            return reject(
                "send_video_frame",
                PublishError::InvalidParams("frame data is null".into()),
            );
        }
        &[]
    } else {
        slice::from_raw_parts(rgba_data, len)
    };

    with_publisher("send_video_frame", ErrorKind::SendFailed, |publisher| {
        publisher.send_video_frame(frame, pts)
    })
}

/// Send `num_samples` samples per channel of interleaved float PCM.
///
/// # Safety
///
/// `pcm_data` must be null or valid for reads of `num_samples` times the
/// configured channel count of `f32` values for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn rtmp_send_audio(pcm_data: *const f32, num_samples: c_int, pts: i64) -> c_int {
    let count = usize::try_from(num_samples).unwrap_or(0);
    with_publisher("send_audio", ErrorKind::SendFailed, |publisher| {
        let channels = publisher
            .config()
            .map_or(0, |config| config.audio_channels as usize);
        let samples: &[f32] = if pcm_data.is_null() || count == 0 || channels == 0 {
            &[]
        } else {
            slice::from_raw_parts(pcm_data, count.saturating_mul(channels))
        };
        if pcm_data.is_null() && count != 0 && publisher.state() == StreamState::Streaming {
            return Err(PublishError::InvalidParams("audio data is null".into()));
        }
        publisher.send_audio(samples, count, pts)
    })
}

#[no_mangle]
pub extern "C" fn rtmp_stop_streaming() -> c_int {
    with_publisher("stop_streaming", ErrorKind::SendFailed, |publisher| {
        publisher.stop_streaming()
    })
}

/// Flush, finish the stream and close the connection. Harmless when not
/// connected.
#[no_mangle]
pub extern "C" fn rtmp_disconnect() -> c_int {
    with_publisher("disconnect", ErrorKind::SendFailed, |publisher| {
        publisher.disconnect()
    })
}

/// Release the session. Safe from any state.
#[no_mangle]
pub extern "C" fn rtmp_cleanup() {
    with_publisher("cleanup", ErrorKind::InitFailed, |publisher| {
        publisher.cleanup();
        Ok(())
    });
    debug!("Bridge cleaned up");
}

/// Current [`StreamState`] code.
#[no_mangle]
pub extern "C" fn rtmp_get_state() -> c_int {
    query(StreamState::Error.code(), |bridge| {
        bridge.publisher.state().code()
    })
}

/// Latest failure message. Valid until the next call into the bridge.
#[no_mangle]
pub extern "C" fn rtmp_get_error() -> *const c_char {
    query(std::ptr::null(), |bridge| bridge.last_error.as_ptr())
}

#[no_mangle]
pub extern "C" fn rtmp_get_bytes_sent() -> i64 {
    query(0, |bridge| {
        i64::try_from(bridge.publisher.statistics().bytes_sent).unwrap_or(i64::MAX)
    })
}

#[no_mangle]
pub extern "C" fn rtmp_get_frames_sent() -> c_int {
    query(0, |bridge| {
        c_int::try_from(bridge.publisher.statistics().frames_sent).unwrap_or(c_int::MAX)
    })
}

#[no_mangle]
pub extern "C" fn rtmp_get_dropped_frames() -> c_int {
    query(0, |bridge| {
        c_int::try_from(bridge.publisher.statistics().dropped_frames).unwrap_or(c_int::MAX)
    })
}

/// 1 when calls go to the inert backend, 0 otherwise.
#[no_mangle]
pub extern "C" fn rtmp_is_stub() -> c_int {
    query(1, |bridge| c_int::from(bridge.publisher.is_stub()))
}

/// 1 when an audio stream is being published.
#[no_mangle]
pub extern "C" fn rtmp_has_audio() -> c_int {
    query(0, |bridge| c_int::from(bridge.publisher.has_audio()))
}

/// Version and backend description. Valid for the life of the process.
#[no_mangle]
pub extern "C" fn rtmp_get_build_info() -> *const c_char {
    BUILD_INFO.as_ptr()
}

/// State, audio status and statistics as a JSON object. Valid until the
/// next call into the bridge.
#[no_mangle]
pub extern "C" fn rtmp_get_stats_json() -> *const c_char {
    query(std::ptr::null(), |bridge| {
        let publisher = &bridge.publisher;
        let json = serde_json::json!({
            "state": publisher.state(),
            "stub": publisher.is_stub(),
            "audio": publisher.audio_status(),
            "stats": publisher.statistics(),
        });
        bridge.stats_json = c_string(&json.to_string());
        bridge.stats_json.as_ptr()
    })
}

/// Log which backend the process runs on. Called by hosts that want the
/// selection made eagerly instead of on the first `rtmp_init`.
#[no_mangle]
pub extern "C" fn rtmp_select_backend() -> c_int {
    let kind = selected_backend();
    info!(backend = ?kind, "Backend selected");
    c_int::from(kind == BackendKind::Stub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RTMP_SUCCESS;
    use serial_test::serial;
    use std::ffi::CStr;

    const INVALID_PARAMS: c_int = -6;
    const NOT_CONNECTED: c_int = -5;

    fn reset() {
        std::env::set_var(publisher_engine::BACKEND_ENV, "stub");
        rtmp_cleanup();
    }

    fn last_error() -> String {
        let ptr = rtmp_get_error();
        assert!(!ptr.is_null());
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn init_720p() -> c_int {
        rtmp_init_simple(1280, 720, 30, 3500, 2, 44100, 2, 128)
    }

    fn connect(url: &str) -> c_int {
        let url = CString::new(url).unwrap();
        unsafe { rtmp_connect(url.as_ptr()) }
    }

    fn send_frame(frame: &[u8], pts: i64) -> c_int {
        unsafe { rtmp_send_video_frame(frame.as_ptr(), frame.len() as c_int, pts) }
    }

    #[test]
    #[serial]
    fn test_scenario_one_frame() {
        reset();
        assert_eq!(init_720p(), RTMP_SUCCESS);
        assert_eq!(rtmp_get_state(), 1);
        assert_eq!(connect("rtmps://host/app/key"), RTMP_SUCCESS);
        assert_eq!(rtmp_start_streaming(), RTMP_SUCCESS);
        assert_eq!(rtmp_get_state(), 3);

        let frame = vec![0u8; 1280 * 720 * 4];
        assert_eq!(send_frame(&frame, 0), RTMP_SUCCESS);
        assert_eq!(rtmp_get_frames_sent(), 1);
        assert_eq!(rtmp_get_dropped_frames(), 0);
        assert_eq!(rtmp_get_bytes_sent(), 1280 * 720 * 4);
        assert_eq!(rtmp_is_stub(), 1);
        rtmp_cleanup();
    }

    #[test]
    #[serial]
    fn test_wrong_frame_size() {
        reset();
        init_720p();
        connect("rtmp://host/app/key");
        rtmp_start_streaming();

        assert_eq!(send_frame(&[0u8; 100], 0), INVALID_PARAMS);
        assert_eq!(rtmp_get_frames_sent(), 0);
        assert!(last_error().contains("expected 3686400 bytes, got 100"));

        let null = unsafe { rtmp_send_video_frame(std::ptr::null(), 16, 0) };
        assert_eq!(null, INVALID_PARAMS);
        let negative = unsafe { rtmp_send_video_frame(std::ptr::null(), -1, 0) };
        assert_eq!(negative, INVALID_PARAMS);
        rtmp_cleanup();
    }

    #[test]
    #[serial]
    fn test_invalid_init_keeps_state() {
        reset();
        assert_eq!(rtmp_init_simple(0, 720, 30, 3500, 2, 44100, 2, 128), INVALID_PARAMS);
        assert_eq!(rtmp_get_state(), 0);
        assert!(last_error().contains("width"));

        assert_eq!(init_720p(), RTMP_SUCCESS);
        assert_eq!(rtmp_init_simple(1280, 720, -1, 3500, 2, 44100, 2, 128), INVALID_PARAMS);
        assert_eq!(rtmp_get_state(), 1);
        assert_eq!(unsafe { rtmp_init(std::ptr::null()) }, INVALID_PARAMS);
        rtmp_cleanup();
    }

    #[test]
    #[serial]
    fn test_init_from_struct_applies_defaults() {
        reset();
        let config = RtmpConfig {
            width: 640,
            height: 360,
            fps: 30,
            bitrate_kbps: 1000,
            ..RtmpConfig::default()
        };
        assert_eq!(unsafe { rtmp_init(&config) }, RTMP_SUCCESS);
        assert_eq!(rtmp_get_state(), 1);
        rtmp_cleanup();
    }

    #[test]
    #[serial]
    fn test_wrong_state_calls() {
        reset();
        let frame = vec![0u8; 1280 * 720 * 4];
        assert_eq!(send_frame(&frame, 0), NOT_CONNECTED);
        assert_eq!(connect("rtmp://host/app/key"), NOT_CONNECTED);
        assert_eq!(rtmp_start_streaming(), NOT_CONNECTED);

        init_720p();
        assert_eq!(send_frame(&frame, 0), NOT_CONNECTED);
        assert_eq!(rtmp_stop_streaming(), NOT_CONNECTED);
        assert_eq!(unsafe { rtmp_connect(std::ptr::null()) }, INVALID_PARAMS);
        assert_eq!(connect("ftp://host/app/key"), INVALID_PARAMS);
        assert_eq!(rtmp_get_state(), 1);
        assert_eq!(rtmp_get_frames_sent(), 0);
        assert_eq!(rtmp_get_dropped_frames(), 0);
        rtmp_cleanup();
    }

    #[test]
    #[serial]
    fn test_round_trip_and_reinit() {
        reset();
        init_720p();
        connect("rtmp://host/app/key");
        rtmp_start_streaming();
        let frame = vec![0u8; 1280 * 720 * 4];
        for i in 0..10 {
            assert_eq!(send_frame(&frame, i * 33), RTMP_SUCCESS);
        }
        let pcm = vec![0.0f32; 2 * 1024];
        assert_eq!(unsafe { rtmp_send_audio(pcm.as_ptr(), 1024, 0) }, RTMP_SUCCESS);
        assert_eq!(unsafe { rtmp_send_audio(pcm.as_ptr(), 0, 0) }, INVALID_PARAMS);

        assert_eq!(rtmp_stop_streaming(), RTMP_SUCCESS);
        assert_eq!(rtmp_disconnect(), RTMP_SUCCESS);
        assert_eq!(rtmp_disconnect(), RTMP_SUCCESS);
        assert_eq!(rtmp_get_state(), 1);
        assert_eq!(rtmp_get_frames_sent(), 10);

        rtmp_cleanup();
        assert_eq!(rtmp_get_state(), 0);
        init_720p();
        assert_eq!(rtmp_get_frames_sent(), 0);
        assert_eq!(rtmp_get_bytes_sent(), 0);
        rtmp_cleanup();
    }

    #[test]
    #[serial]
    fn test_stats_json() {
        reset();
        init_720p();
        let ptr = rtmp_get_stats_json();
        let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["state"], "Initialized");
        assert_eq!(value["stats"]["frames_sent"], 0);
        assert_eq!(value["stub"], true);
        rtmp_cleanup();
    }

    #[test]
    #[serial]
    fn test_build_info() {
        reset();
        let info = unsafe { CStr::from_ptr(rtmp_get_build_info()) }
            .to_string_lossy()
            .into_owned();
        assert!(info.starts_with("rtmp-bridge "));
        assert_eq!(rtmp_select_backend(), 1);
    }
}
