//! S3-compatible backend for bakery-sync (AWS S3, Cloudflare R2, MinIO).

mod storage;

pub use storage::{parse_uri, S3Store};
