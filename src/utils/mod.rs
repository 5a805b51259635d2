//! Утилиты

pub mod audio;
pub mod crypto;
