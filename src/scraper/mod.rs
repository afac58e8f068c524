//! Form-driving layer: postback synchronisation, the selection sequencer,
//! the extraction gate and the cell/name cleaners they share.

pub mod cleaner;
pub mod extract;
pub mod postback;
pub mod sequencer;

pub use self::extract::{ExtractionGate, parse_table};
pub use self::postback::{Settle, await_settle};
pub use self::sequencer::Sequencer;
