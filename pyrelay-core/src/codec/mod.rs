//! Value codec
//!
//! Translates between host [`Value`]s and the text that crosses the pipes.
//! Host → peer text is Python source; peer → host text is a restricted
//! literal grammar parsed by [`Decoder`].

mod array;
mod decode;
mod encode;
mod value;

pub use decode::Decoder;
pub use encode::{py_float, py_str, Encoder};
pub use value::{NdArray, Value};
