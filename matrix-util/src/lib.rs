pub mod common_io;
pub mod dmatrix_util;
pub mod tensor_io;
pub mod tensor_util;
pub mod traits;
pub mod utils;
