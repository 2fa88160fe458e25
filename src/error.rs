use thiserror::Error;

/// Errors produced by the NDT client.
///
/// Every failure the protocol engine can report is a distinct variant, so
/// callers can tell a transport-level read failure (`Reading*`) apart from a
/// well-framed but unexpected message (`Not*`) and from a malformed payload
/// (`Invalid*`).
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection. Distinct from a hard I/O error
    /// because several protocol states treat EOF as a success condition.
    #[error("connection closed by peer")]
    Eof,

    /// A read, write or connect wait expired.
    #[error("operation timed out")]
    Timeout,

    #[error("event loop error: {0}")]
    Reactor(String),

    #[error("cannot connect control connection: {0}")]
    ConnectControlConnection(#[source] Box<Error>),

    #[error("cannot connect test connection: {0}")]
    ConnectTestConnection(#[source] Box<Error>),

    #[error("cannot format extended login message")]
    FormatExtendedLoginMessage,

    #[error("message payload longer than 65535 bytes")]
    MessageTooLong,

    #[error("cannot read message type and length: {0}")]
    ReadingMessageTypeLength(#[source] Box<Error>),

    #[error("cannot read message payload: {0}")]
    ReadingMessagePayload(#[source] Box<Error>),

    #[error("cannot parse message payload as JSON")]
    JsonParse,

    #[error("JSON message payload lacks the expected key")]
    JsonKey,

    #[error("cannot read kickoff message: {0}")]
    ReadingKickoffMessage(#[source] Box<Error>),

    #[error("kickoff message does not match the expected bytes")]
    InvalidKickoffMessage,

    #[error("cannot read SRV_QUEUE message: {0}")]
    ReadingSrvQueueMessage(#[source] Box<Error>),

    #[error("expected SRV_QUEUE message, got type {0}")]
    NotSrvQueueMessage(u8),

    #[error("SRV_QUEUE payload is not an unsigned integer")]
    InvalidSrvQueueMessage,

    #[error("server reported a fault while queueing")]
    QueueServerFault,

    #[error("server is busy, try again later")]
    QueueServerBusy,

    #[error("cannot read server version message: {0}")]
    ReadingServerVersionMessage(#[source] Box<Error>),

    #[error("expected MSG_LOGIN with server version, got type {0}")]
    NotServerVersionMessage(u8),

    #[error("cannot read tests-id message: {0}")]
    ReadingTestsIdMessage(#[source] Box<Error>),

    #[error("expected MSG_LOGIN with granted tests, got type {0}")]
    NotTestsIdMessage(u8),

    #[error("granted test identifier is not an integer: {0:?}")]
    InvalidTestId(String),

    #[error("server granted an unknown test: {0}")]
    UnknownTestId(i32),

    #[error("cannot read TEST_PREPARE message: {0}")]
    ReadingTestPrepare(#[source] Box<Error>),

    #[error("expected TEST_PREPARE message, got type {0}")]
    NotTestPrepare(u8),

    #[error("TEST_PREPARE carries an invalid port")]
    InvalidPort,

    #[error("TEST_PREPARE carries an invalid duration")]
    InvalidDuration,

    #[error("TEST_PREPARE carries an invalid snaps delay")]
    InvalidSnapsDelay,

    #[error("TEST_PREPARE carries an invalid number of streams")]
    InvalidNumStreams,

    #[error("cannot read TEST_START message: {0}")]
    ReadingTestStart(#[source] Box<Error>),

    #[error("expected TEST_START message, got type {0}")]
    NotTestStart(u8),

    #[error("cannot read TEST_MSG message: {0}")]
    ReadingTestMsg(#[source] Box<Error>),

    #[error("expected TEST_MSG message, got type {0}")]
    NotTestMsg(u8),

    #[error("cannot serialize TEST_MSG message")]
    SerializingTestMsg,

    #[error("cannot write TEST_MSG message: {0}")]
    WritingTestMsg(#[source] Box<Error>),

    #[error("cannot read TEST_FINALIZE message: {0}")]
    ReadingTestFinalize(#[source] Box<Error>),

    #[error("expected TEST_FINALIZE message, got type {0}")]
    NotTestFinalize(u8),

    #[error("cannot read MSG_RESULTS or MSG_LOGOUT: {0}")]
    ReadingResultsOrLogout(#[source] Box<Error>),

    #[error("expected MSG_RESULTS or MSG_LOGOUT, got type {0}")]
    NotResultsOrLogout(u8),

    #[error("error while waiting for the server to close: {0}")]
    WaitingClose(#[source] Box<Error>),

    #[error("server sent data after logout")]
    DataAfterLogout,

    #[error("mlab-ns query failed: {0}")]
    MlabnsQuery(String),
}

impl Error {
    /// True for the EOF condition protocol code uses to detect that a
    /// stream ended because the peer closed it.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }

    /// True when the error is the typed timeout produced by an expired wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
