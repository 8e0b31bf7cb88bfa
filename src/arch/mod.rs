//! Architecture Layer
//!
//! The two places register-level capability state is touched: the
//! per-walker scratch register and the saved thread frame.

pub mod ctemp;
pub mod frame;

pub use ctemp::CapTemp;
pub use frame::{td_frame_revoke, TrapFrame};
