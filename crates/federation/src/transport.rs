//! Request/response transport between nodes.
//!
//! A transport carries [`Command`]s to a peer address and returns the
//! matching [`CommandResponse`]. Inbound requests are handed to the node as
//! [`Rpc`]s on a channel; the node answers through [`Rpc::respond`].

use async_trait::async_trait;
use hashweave_protocol::{Command, CommandResponse};
use tokio::sync::{mpsc, oneshot};

use crate::errors::TransportError;

/// An inbound request waiting for its response
#[derive(Debug)]
pub struct Rpc {
    pub command: Command,
    respond_to: oneshot::Sender<CommandResponse>,
}

impl Rpc {
    pub fn new(command: Command) -> (Self, oneshot::Receiver<CommandResponse>) {
        let (respond_to, rx) = oneshot::channel();
        (Self { command, respond_to }, rx)
    }

    /// Send the response back; a requester that gave up is ignored.
    pub fn respond(self, response: CommandResponse) {
        let _ = self.respond_to.send(response);
    }

    /// Split into the command and the channel its response goes to.
    pub fn into_parts(self) -> (Command, oneshot::Sender<CommandResponse>) {
        (self.command, self.respond_to)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Address peers use to reach this node
    fn local_addr(&self) -> String;

    /// Send `command` to `target` and wait for the response.
    async fn request(&self, target: &str, command: Command) -> Result<CommandResponse, TransportError>;

    /// Stream of inbound requests. Only the first call gets it.
    fn take_consumer(&self) -> Option<mpsc::Receiver<Rpc>>;

    /// Stop serving inbound requests.
    async fn close(&self) -> Result<(), TransportError>;
}
