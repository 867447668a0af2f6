//! Reject codes carried in `ref`/`rep` signals to clients. The numeric values
//! are fixed for interoperability and must not be renumbered.

pub const STATE_ERROR: u32 = 202;
pub const SYSTEM_NOT_STARTED: u32 = 203;
pub const LENGTH_ERROR: u32 = 207;
pub const ZERO_KEYLEN: u32 = 208;
pub const SIGNAL_ERROR: u32 = 209;
pub const NO_ATTR_BUFFER: u32 = 217;
pub const NO_DATA_RECORD: u32 = 218;
pub const NO_FREE_API_CONNECTION: u32 = 219;
pub const TOO_MUCH_ATTRINFO: u32 = 220;
pub const INVALID_CONNECTION: u32 = 229;
pub const COMMIT_IN_PROGRESS: u32 = 230;
pub const ROLLBACK_NOT_ALLOWED: u32 = 232;
pub const NO_FREE_TC_CONNECTION: u32 = 233;
pub const ABORT_IN_PROGRESS: u32 = 237;
pub const WRONG_SCHEMA_VERSION: u32 = 241;
pub const NO_CONCURRENCY: u32 = 242;
pub const TOO_HIGH_CONCURRENCY: u32 = 244;
pub const NO_SCAN_RECORD: u32 = 245;
pub const NO_FRAGMENT_RECORD: u32 = 246;
pub const SCAN_NODE_ERROR: u32 = 250;
pub const TIME_OUT: u32 = 266;
pub const SCAN_AI_LEN_ERROR: u32 = 269;
pub const SCAN_LQH_ERROR: u32 = 270;
pub const SCAN_FRAG_LQH_ERROR: u32 = 274;
pub const SEIZE_API_COPY_ERROR: u32 = 275;
pub const SCAN_IN_PROGRESS: u32 = 276;
pub const ABORT_ERROR: u32 = 277;
pub const COMMIT_TYPE_ERROR: u32 = 278;
pub const NO_FREE_MARKER: u32 = 279;
pub const NODE_SHUTDOWN: u32 = 280;
pub const CLUSTER_SHUTDOWN: u32 = 281;
pub const DROP_TABLE_IN_PROGRESS: u32 = 283;
pub const NO_SUCH_TABLE: u32 = 284;
pub const UNKNOWN_TABLE: u32 = 285;
pub const NODE_FAIL_BEFORE_COMMIT: u32 = 286;
pub const SCAN_TIME_OUT: u32 = 296;
pub const SCAN_TIME_OUT_CLOSING: u32 = 297;
pub const SINGLE_USER_MODE: u32 = 299;
pub const NOT_FOUND: u32 = 626;
pub const ALREADY_EXISTS: u32 = 630;
pub const WRITE_CONSTRAINT_A: u32 = 839;
pub const WRITE_CONSTRAINT_B: u32 = 840;
pub const NOT_UNIQUE: u32 = 893;
