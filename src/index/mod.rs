pub mod posting;
pub mod forward;
pub mod term_dict;
pub mod inverted;
pub mod field;
pub mod partition;
