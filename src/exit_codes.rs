/// Process exit codes of the foreground command.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    /// The operation ended in `failed` or `aborted`.
    pub const OPERATION_FAILURE: i32 = 1;
    /// Bad configuration, a rejected request or an unanswered one.
    pub const ERROR: i32 = 255;
}
