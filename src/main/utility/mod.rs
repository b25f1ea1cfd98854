pub mod os;
pub mod special_files;
