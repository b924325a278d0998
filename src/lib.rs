//! Real-time medical interpreter session core.
//!
//! A client-side engine for doctor/patient interpretation over a
//! realtime speech service: it establishes a peer-to-peer audio session
//! with a JSON event protocol on a side channel, reconciles streaming
//! partial and final transcripts into an ordered conversation log,
//! classifies utterances by language and intent with rule-based
//! detectors, and dispatches model-invoked tool calls (appointment
//! scheduling, lab orders, summaries, session end) into application
//! handlers with idempotent action recording.
//!
//! The UI, credential minting, and long-term storage are collaborators:
//! the crate exposes [`session::SessionController`] for lifecycle and
//! observable state, [`archive::ConversationArchive`] for persistence,
//! and [`transport::audio::AudioSink`] for playback. Device I/O is
//! optional behind the `audio-io` feature.
//!
//! ```no_run
//! use std::sync::Arc;
//! use medrelay::config::SessionConfig;
//! use medrelay::session::SessionController;
//!
//! # async fn run() -> medrelay::error::Result<()> {
//! let mut session = SessionController::new(SessionConfig::new("https://example.org/api/session"));
//! session.set_conversation_end_callback(Arc::new(|| println!("conversation over")));
//! session.register_clinic_tools();
//! session.start().await?;
//! session.send_text("Please ask about current medications")?;
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
pub mod convo;
pub mod detect;
pub mod error;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;
pub mod wake;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use session::{SessionController, SessionState};
