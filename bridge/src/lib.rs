//! C-callable RTMP(S) publishing bridge.
//!
//! Wraps one process-default [`Publisher`] behind a mutex so that every
//! exported call is atomic with respect to every other. Status codes and
//! state codes follow `include/rtmp_bridge.h`; the detail of the latest
//! failure is kept for `rtmp_get_error()`.
//!
//! Rust callers that want more than one session should use
//! [`publisher_engine::Publisher`] directly.

mod api;

use std::ffi::CString;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use publisher_engine::Publisher;
use publisher_types::{ErrorKind, PublishError, PublishResult};

pub use api::*;

/// Status code of a successful call.
pub const RTMP_SUCCESS: i32 = 0;

/// Environment variable holding the log filter, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "RTMP_BRIDGE_LOG";

const DEFAULT_LOG_FILTER: &str = "rtmp_bridge=info,publisher_engine=info,publisher_transport=info,\
     publisher_encoder=info,publisher_convert=info";

/// The process-default session and the C-visible strings it hands out.
struct Bridge {
    publisher: Publisher,
    last_error: CString,
    stats_json: CString,
}

impl Bridge {
    fn new() -> Self {
        Self {
            publisher: Publisher::new(),
            last_error: CString::default(),
            stats_json: CString::default(),
        }
    }

    fn record_error(&mut self, message: &str) {
        self.last_error = c_string(message);
    }
}

static BRIDGE: Lazy<Mutex<Bridge>> = Lazy::new(|| Mutex::new(Bridge::new()));

static LOGGING: Once = Once::new();

/// Install the tracing subscriber once per process. A subscriber already
/// installed by the host is left alone.
fn init_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
        if installed.is_err() {
            warn!("A tracing subscriber is already installed, keeping it");
        }
    });
}

/// NUL bytes would truncate the message on the C side.
fn c_string(message: &str) -> CString {
    CString::new(message.replace('\0', " ")).unwrap_or_default()
}

/// Run `operation` on the default publisher and turn the outcome into a
/// status code. A panic is contained and reported as `on_panic`.
fn with_publisher<F>(name: &'static str, on_panic: ErrorKind, operation: F) -> i32
where
    F: FnOnce(&mut Publisher) -> PublishResult<()>,
{
    init_logging();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut bridge = BRIDGE.lock();
        let result = operation(&mut bridge.publisher);
        if let Err(e) = &result {
            bridge.record_error(&e.to_string());
        }
        result
    }));

    match result {
        Ok(Ok(())) => RTMP_SUCCESS,
        Ok(Err(e)) => {
            warn!(operation = name, error = %e, code = e.code(), "Call failed");
            e.code()
        }
        Err(_) => {
            error!(operation = name, "Panic contained at the C boundary");
            let message = format!("internal error in {}", name);
            BRIDGE.lock().record_error(&message);
            on_panic.code()
        }
    }
}

/// Read from the default publisher. A panic yields `fallback`.
fn query<T, F>(fallback: T, read: F) -> T
where
    F: FnOnce(&mut Bridge) -> T,
{
    init_logging();
    panic::catch_unwind(AssertUnwindSafe(|| {
        let mut bridge = BRIDGE.lock();
        read(&mut *bridge)
    }))
    .unwrap_or(fallback)
}

/// Record a failure detected before the publisher is reached.
fn reject(name: &'static str, e: PublishError) -> i32 {
    with_publisher(name, e.kind(), |_| Err(e))
}
