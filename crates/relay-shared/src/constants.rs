/// Application name
pub const APP_NAME: &str = "Relay";

/// Payload schema version understood by this client
pub const PAYLOAD_VERSION: u64 = 1;

/// Conference call signaling level carried in call control payloads
pub const CALL_PROTOCOL_LEVEL: i64 = 1;

/// Call join messages older than this (server age) are ignored
pub const STALE_CALL_JOIN_TIMEOUT_MS: u64 = 60_000;

/// Preview text used for threads with no visible interaction
pub const EMPTY_THREAD_PREVIEW: &str = "";

/// Maximum number of participant names in a generated group label
pub const MAX_GENERATED_TITLE_NAMES: usize = 3;

/// Maximum length (in chars) of a quoted message excerpt
pub const QUOTE_EXCERPT_CHARS: usize = 120;

/// Top-level payload keys
pub mod keys {
    pub const VERSION: &str = "version";
    pub const MESSAGE_ID: &str = "messageId";
    pub const MESSAGE_TYPE: &str = "messageType";
    pub const MESSAGE_REF: &str = "messageRef";
    pub const THREAD_ID: &str = "threadId";
    pub const THREAD_TYPE: &str = "threadType";
    pub const THREAD_TITLE: &str = "threadTitle";
    pub const DISTRIBUTION: &str = "distribution";
    pub const EXPRESSION: &str = "expression";
    pub const PRETTY: &str = "pretty";
    pub const USER_IDS: &str = "userIds";
    pub const SENDER: &str = "sender";
    pub const USER_ID: &str = "userId";
    pub const DATA: &str = "data";

    // data blob
    pub const BODY: &str = "body";
    pub const BODY_TYPE: &str = "type";
    pub const BODY_VALUE: &str = "value";
    pub const ATTACHMENTS: &str = "attachments";
    pub const EXPIRATION: &str = "expiration";
    pub const CONTROL: &str = "control";
    pub const THREAD_UPDATES: &str = "threadUpdates";
    pub const READ_MARK: &str = "readMark";
    pub const SNOOZE_UNTIL: &str = "snoozeUntil";
    pub const RECEIPT: &str = "receipt";

    // call signaling
    pub const CALL_ID: &str = "callId";
    pub const PEER_ID: &str = "peerId";
    pub const ORIGINATOR: &str = "originator";
    pub const MEMBERS: &str = "members";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const SDP: &str = "sdp";
    pub const ICE_CANDIDATES: &str = "icecandidates";
}

/// MIME types accepted for message bodies
pub const BODY_TYPE_PLAIN: &str = "text/plain";
pub const BODY_TYPE_HTML: &str = "text/html";
