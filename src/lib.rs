mod sif_lib;

pub use sif_lib::*;
