use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("no free region large enough for the requested allocation")]
    NoFit,
    #[error("cannot allocate a zero-sized region")]
    ZeroSize,
    #[error("requested allocation of {0} bytes exceeds the 24-bit arena header length field")]
    TooLarge(usize),
}

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is full")]
    Full,
}
