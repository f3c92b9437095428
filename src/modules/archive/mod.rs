pub mod attachment;
pub mod blob;
pub mod correspondent;
pub mod email;
pub mod restore;
pub mod writer;
