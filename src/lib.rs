//! Client for DATAQ DI-718B-E(S) data acquisition units streaming over TCP.
//!
//! ```no_run
//! use dataq_stream::{CancelToken, Calibration, ReadOutcome, Session, SessionConfig, DEFAULT_PORT};
//!
//! let config = SessionConfig::default();
//! let mut session = Session::connect("di718b", DEFAULT_PORT, &config)?;
//! let cancel = CancelToken::new();
//! if let ReadOutcome::Block(block) = session.read_block(1, &cancel)? {
//!     for values in block.decode(&Calibration::default()) {
//!         println!("{:?}", values?);
//!     }
//! }
//! session.close();
//! # Ok::<(), dataq_stream::Error>(())
//! ```

pub mod command;
pub mod di718b;
pub mod frame;

pub use command::send_command;
pub use di718b::{
    BUFFER_WORDS, CancelToken, DEFAULT_PORT, DEFAULT_SCAN_LIST, Error, MAX_CHANNELS, RawBlock,
    ReadOutcome, Session, SessionConfig, SessionState, Timing, autodiscover,
};
pub use frame::{Calibration, DecodeError, decode_row};
