pub mod gic;
pub mod gpio;
pub mod sd;
pub mod uart;

pub use self::{
    gic::Gic,
    sd::{CardInfo, SdCard},
};
