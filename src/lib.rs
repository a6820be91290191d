// CCat Codec Library
//
// Streaming Cauchy-matrix erasure code for real-time packet streams.
// A sender injects small numbers of recovery packets alongside its original
// datagrams; a receiver uses whichever recovery packets arrive to rebuild
// lost originals from a sliding window, with no retransmission round trip.
//
// The codec is best-effort: originals that age out of the window are gone,
// and unrecoverable losses are never reported to the application.

pub mod bitset;
pub mod cauchy;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod gf256;
pub mod pool;
pub mod seq;
pub mod session;

pub use config::CodecConfig;
pub use decoder::DecoderStats;
pub use encoder::Recovery;
pub use error::CcatError;
pub use session::{RecoveredHandler, Session};

/// Encoder ring capacity. Equal to the column coefficient space so a
/// recovery span never repeats a column.
pub const MAX_ENCODER_WINDOW: usize = 192;

/// Decoder ring capacity in packets. A multiple of 64 so the loss bitset
/// shifts whole words.
pub const DECODER_WINDOW: usize = 384;

/// Recovery row index space. Also bounds the solver submatrix, so at most
/// this many losses can be recovered in one solve.
pub const MAX_RECOVERY_ROWS: usize = 64;

/// Column coefficient space. The column index of a sequence number is
/// `sequence % MATRIX_COLUMNS`.
pub const MATRIX_COLUMNS: usize = 192;

const _: () = assert!(DECODER_WINDOW % 64 == 0);
const _: () = assert!(MATRIX_COLUMNS + MAX_RECOVERY_ROWS <= 256);
const _: () = assert!(MAX_ENCODER_WINDOW <= MATRIX_COLUMNS);
