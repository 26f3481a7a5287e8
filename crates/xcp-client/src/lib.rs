//! XCP client.
//!
//! Async facade over the Sans-IO engine in [`xcp_core`]: connect over TCP
//! (or any `AsyncRead + AsyncWrite` stream), complete the HELLO/CAPS
//! handshake, then `send`, `request`, `ping`, and `recv`. One writer task
//! and one reader task serialize stream access; NACKs carrying a retry
//! hint are retransmitted automatically with jittered backoff.
//!
//! ```no_run
//! use xcp_client::Client;
//! use xcp_core::{Ether, SendOptions, SessionConfig};
//!
//! # async fn demo() -> xcp_core::Result<()> {
//! let client = Client::connect("127.0.0.1:9433", SessionConfig::default()).await?;
//! let hello = Ether::new("text", 1)?.with_payload("text", "hi");
//! let reply = client.request(&hello, SendOptions::default(), None).await?;
//! println!("{:?}", reply.payload);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;

pub use client::{Client, ClientEvent};
pub use xcp_core::{
    CodecPolicy, Environment, Ether, Result, SendOptions, SessionConfig, SessionError, SystemEnv,
};
