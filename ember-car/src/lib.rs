//! Implementation of the [car](https://ipld.io/specs/transport/car/) format.

mod error;
mod header;
mod reader;
mod util;
mod writer;

pub use crate::{
    error::Error,
    header::{CarHeader, CarHeaderV1},
    reader::CarReader,
    util::{section_len, MAX_ALLOC},
    writer::CarWriter,
};
