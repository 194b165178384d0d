use lazy_static::lazy_static;
use prometheus::{
    opts, register_counter, register_counter_vec, register_gauge, register_histogram,
    histogram_opts,
};
use prometheus::{Counter, CounterVec, Gauge, Histogram};

pub mod proxy {
    use super::*;
    lazy_static! {
        pub static ref REQUESTS: CounterVec = register_counter_vec!(
            opts!("proxy_requests_total", "Requests forwarded to the backend."),
            &["method"]
        )
        .unwrap();
        pub static ref ERRORS: Counter = register_counter!(opts!(
            "proxy_errors_total",
            "Requests answered with PROXY_ERROR after a transport failure."
        ))
        .unwrap();
        pub static ref SSE_PASSTHROUGH: Counter = register_counter!(opts!(
            "proxy_sse_passthrough_total",
            "Backend event streams relayed without buffering."
        ))
        .unwrap();
    }
}

pub mod analyze {
    use super::*;
    lazy_static! {
        pub static ref SESSIONS: Counter =
            register_counter!(opts!("analyze_sessions_total", "Analysis sessions opened.")).unwrap();
        pub static ref REJECTED: Counter = register_counter!(opts!(
            "analyze_rejected_total",
            "Analysis requests rejected before a stream was opened."
        ))
        .unwrap();
        pub static ref OPEN_STREAMS: Gauge =
            register_gauge!(opts!("analyze_open_streams", "Analysis streams currently open."))
                .unwrap();
        pub static ref TERMINAL_FRAMES: CounterVec = register_counter_vec!(
            opts!("analyze_terminal_frames_total", "Terminal frames sent, by event and code."),
            &["event", "code"]
        )
        .unwrap();
        pub static ref SESSION_DURATION: Histogram = register_histogram!(histogram_opts!(
            "analyze_session_duration_seconds",
            "Wall-clock duration of analysis streams.",
            vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0],
        ))
        .unwrap();
    }
}

pub mod voice_clone {
    use super::*;
    lazy_static! {
        pub static ref STATUS_QUERIES: CounterVec = register_counter_vec!(
            opts!("voice_clone_status_queries_total", "Voice clone status lookups, by outcome."),
            &["outcome"]
        )
        .unwrap();
    }
}
