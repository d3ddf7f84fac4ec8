#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result, Status};

mod method;
pub use method::{MethodId, Pattern};

mod msg;
pub use msg::{Message, MsgFlags, MsgMeta, Payload, SendMsg};

mod codec;

mod call_table;

mod call;
pub use call::{CallCanceller, CallState, ClientCall, ServerCall};

mod context;
pub use context::Context;

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

mod channel;
pub use channel::{Channel, ChannelConfig};

mod stream;
pub use stream::{
    BidiStream, BidiStreaming, ClientStreaming, RequestStream, ResponseSink, Streaming,
};

mod router;
pub use router::{BoxFuture, Method, MethodEntry, Router};

mod dispatcher;
pub use dispatcher::Dispatcher;

mod client;
pub use client::{Client, ClientConfig};

mod listener;
pub use listener::Listener;

mod server;
pub use server::Server;
