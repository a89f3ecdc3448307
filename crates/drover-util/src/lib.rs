//! Functionality the drover client needs from the machine it runs on and the
//! wire it talks over: framed TLS messaging, hashed working directories,
//! process memory probing, and bounded output capture.

pub mod fs;
pub mod host;
pub mod net;
pub mod stdio;
