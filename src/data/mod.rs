pub mod literal;
pub mod value;

pub use literal::{is_like_placeholder, parse_literal, placeholder_in, placeholder_of, Literal, Placeholder};
pub use value::{compare, lookup_path, set_path, values_equal, TypeTag};
