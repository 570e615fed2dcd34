//! Tool parameter surface for session queries

mod sessions;

pub use sessions::{
    DateFilter, FilterMessagesParams, GetMessageContextParams, GetSessionMessagesParams,
    GetSessionSummariesParams, SearchSessionsParams, SessionTools,
    TOOL_MESSAGE_CONTEXT_SIZE, TOOL_SESSION_MESSAGES_LIMIT,
};
