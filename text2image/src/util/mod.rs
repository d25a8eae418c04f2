
pub mod random;

pub mod tensor_ext;
