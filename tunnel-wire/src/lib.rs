//! Wire-level building blocks shared by the broker and agent: raw HTTP/1.1
//! message framing and the WebSocket frame codec used once a session
//! socket has left HTTP mode.

pub mod accept;
pub mod error;
pub mod frame;
pub mod http_message;

pub use accept::compute_accept_key;
pub use error::{WireError, WireResult};
pub use frame::{decode_message, encode_message, Decoded, Message, Opcode, READ_TIMEOUT};
pub use http_message::{
    copy_body, copy_chunked_body, copy_fixed_body, is_hop_by_hop_header, read_request_head, read_response_head,
    request_framing, response_framing, write_request_head, write_response_head, BodyFraming, RequestHead,
    ResponseHead, HOP_BY_HOP_HEADERS,
};
