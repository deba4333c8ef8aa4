pub mod atomic_file;
pub mod cancel;
pub mod topk;
