#![forbid(unsafe_code)]

pub mod instrument;
pub mod observatory;

pub use instrument::{
    InstrumentBotpt, InstrumentConnection, InstrumentRsn, InstrumentSerial, InstrumentTcp,
};
pub use observatory::ObservatoryConnection;
