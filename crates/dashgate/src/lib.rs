//! Republishes ClearKey-protected MPEG-DASH streams as HLS.
//!
//! ```text
//!                  ┌──────────────────┐
//!  stream id ─────►│     Gateway      │  start / stop / status / health
//!                  └────────┬─────────┘
//!                           │ one monitor task per session
//!                  ┌────────▼─────────┐
//!                  │     Monitor      ├──► StrategySelector
//!                  └────────┬─────────┘
//!          ┌────────────────┼─────────────────────┐
//!          ▼                ▼                     ▼
//!       Direct     DecryptThenTranscode      DecryptPipe
//!     transcoder   resolve + decrypt +    downloader | transcoder
//!                    transcode files
//!                           │
//!                           ▼
//!               <work_dir>/<stream id>/playlist.m3u8
//! ```
//!
//! Failures are classified from the stderr tail of the process that died
//! and fed to the [`RetryPolicy`](retry::RetryPolicy), which decides
//! whether and when the session restarts.

pub mod classify;
pub mod config;
pub mod dash;
pub mod decrypt;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod supervisor;
pub mod util;

pub use classify::{ErrorAnalysis, ErrorCategory};
pub use config::{GatewayConfig, StreamConfig};
pub use decrypt::ClearKeyCredential;
pub use error::{GatewayError, GatewayResult};
pub use pipeline::PipelineMethod;
pub use supervisor::{
    ConnectivityReport, Gateway, HealthReport, SessionSnapshot, SessionStatus, StopOutcome,
};
