use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::Digest;
use thiserror::Error;

/// Identifier for an outstanding request, scoped to a (peer, chain) pair.
pub type RequestId = u32;

/// Request id reserved for unsolicited [Message::Put] gossip.
///
/// A peer receiving a `Put` with this id knows it never sent a matching
/// `Get` and treats the container as gossip.
pub const GOSSIP_REQUEST_ID: RequestId = u32::MAX;

/// Maximum number of container ids in a single frontier or accepted
/// message.
pub const MAX_CONTAINER_IDS: usize = 1024;

/// Maximum number of containers in a [Message::MultiPut] response.
pub const MAX_CONTAINERS_PER_MULTIPUT: usize = 2000;

/// Consensus parameters for a snowman instance.
#[derive(Clone, Copy, Debug)]
pub struct Parameters {
    /// Sample size per poll.
    pub k: usize,
    /// Quorum threshold: minimum votes for a child to count as a
    /// successful poll.
    pub alpha: usize,
    /// Consecutive successful polls to finalize a block with no
    /// conflicts.
    pub beta_virtuous: u32,
    /// Consecutive successful polls to finalize a block with conflicts.
    pub beta_rogue: u32,
    /// Target number of concurrent polls.
    pub concurrent_repolls: usize,
}

impl Parameters {
    /// Enforce that the parameters are internally consistent.
    pub fn assert(&self) {
        assert!(self.k > 0, "sample size must be positive");
        assert!(
            self.alpha > self.k / 2 && self.alpha <= self.k,
            "alpha must be in (k/2, k]"
        );
        assert!(self.beta_virtuous > 0, "beta_virtuous must be positive");
        assert!(
            self.beta_rogue >= self.beta_virtuous,
            "beta_rogue must be at least beta_virtuous"
        );
        assert!(
            self.concurrent_repolls > 0,
            "must be able to issue at least one poll"
        );
    }
}

/// The kind of an outstanding request, used to synthesize the matching
/// failure when the request cannot complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GetAcceptedFrontier,
    GetAccepted,
    GetAncestors,
    Get,
    PullQuery,
    PushQuery,
    AppRequest,
}

impl RequestKind {
    /// Static label for metrics and logs.
    pub fn op(&self) -> &'static str {
        match self {
            Self::GetAcceptedFrontier => "get_accepted_frontier",
            Self::GetAccepted => "get_accepted",
            Self::GetAncestors => "get_ancestors",
            Self::Get => "get",
            Self::PullQuery => "pull_query",
            Self::PushQuery => "push_query",
            Self::AppRequest => "app_request",
        }
    }
}

/// Fatal errors for a chain.
///
/// Everything else (malformed messages, unexpected responses, failed
/// verification) is consumed locally and logged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("network closed")]
    NetworkClosed,
    #[error("mailbox closed")]
    MailboxClosed,
    #[error("vm failed to accept block: {0}")]
    VmAccept(String),
    #[error("last accepted block unavailable from the vm")]
    MissingLastAccepted,
    #[error("bootstrap exhausted its restart budget ({0} restarts)")]
    BootstrapFailed(u32),
}

/// Every message exchanged between validators on a chain's consensus
/// channel.
///
/// Requests carry a `deadline` (unix seconds) after which the recipient
/// should not bother responding; responses echo the request's id. The
/// chain itself is identified by the p2p channel the message arrives on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message<D: Digest> {
    GetAcceptedFrontier {
        id: RequestId,
        deadline: u64,
    },
    AcceptedFrontier {
        id: RequestId,
        containers: Vec<D>,
    },
    GetAccepted {
        id: RequestId,
        deadline: u64,
        containers: Vec<D>,
    },
    Accepted {
        id: RequestId,
        containers: Vec<D>,
    },
    GetAncestors {
        id: RequestId,
        deadline: u64,
        container: D,
    },
    /// Ancestor containers, child first, then its parents toward the
    /// root.
    MultiPut {
        id: RequestId,
        containers: Vec<Bytes>,
    },
    Get {
        id: RequestId,
        deadline: u64,
        container: D,
    },
    Put {
        id: RequestId,
        container: D,
        bytes: Bytes,
    },
    PushQuery {
        id: RequestId,
        deadline: u64,
        container: D,
        bytes: Bytes,
    },
    PullQuery {
        id: RequestId,
        deadline: u64,
        container: D,
    },
    /// A single preference vote (exactly one entry for a linear chain).
    Chits {
        id: RequestId,
        votes: Vec<D>,
    },
    AppRequest {
        id: RequestId,
        deadline: u64,
        payload: Bytes,
    },
    AppResponse {
        id: RequestId,
        payload: Bytes,
    },
    AppGossip {
        payload: Bytes,
    },
}

impl<D: Digest> Message<D> {
    /// Static label for metrics and logs.
    pub fn op(&self) -> &'static str {
        match self {
            Self::GetAcceptedFrontier { .. } => "get_accepted_frontier",
            Self::AcceptedFrontier { .. } => "accepted_frontier",
            Self::GetAccepted { .. } => "get_accepted",
            Self::Accepted { .. } => "accepted",
            Self::GetAncestors { .. } => "get_ancestors",
            Self::MultiPut { .. } => "multi_put",
            Self::Get { .. } => "get",
            Self::Put { .. } => "put",
            Self::PushQuery { .. } => "push_query",
            Self::PullQuery { .. } => "pull_query",
            Self::Chits { .. } => "chits",
            Self::AppRequest { .. } => "app_request",
            Self::AppResponse { .. } => "app_response",
            Self::AppGossip { .. } => "app_gossip",
        }
    }

    /// The request deadline, if this message is a request.
    pub fn deadline(&self) -> Option<u64> {
        match self {
            Self::GetAcceptedFrontier { deadline, .. }
            | Self::GetAccepted { deadline, .. }
            | Self::GetAncestors { deadline, .. }
            | Self::Get { deadline, .. }
            | Self::PushQuery { deadline, .. }
            | Self::PullQuery { deadline, .. }
            | Self::AppRequest { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }
}

impl<D: Digest> Write for Message<D> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::GetAcceptedFrontier { id, deadline } => {
                buf.put_u8(0);
                id.write(buf);
                deadline.write(buf);
            }
            Self::AcceptedFrontier { id, containers } => {
                buf.put_u8(1);
                id.write(buf);
                containers.write(buf);
            }
            Self::GetAccepted {
                id,
                deadline,
                containers,
            } => {
                buf.put_u8(2);
                id.write(buf);
                deadline.write(buf);
                containers.write(buf);
            }
            Self::Accepted { id, containers } => {
                buf.put_u8(3);
                id.write(buf);
                containers.write(buf);
            }
            Self::GetAncestors {
                id,
                deadline,
                container,
            } => {
                buf.put_u8(4);
                id.write(buf);
                deadline.write(buf);
                container.write(buf);
            }
            Self::MultiPut { id, containers } => {
                buf.put_u8(5);
                id.write(buf);
                containers.write(buf);
            }
            Self::Get {
                id,
                deadline,
                container,
            } => {
                buf.put_u8(6);
                id.write(buf);
                deadline.write(buf);
                container.write(buf);
            }
            Self::Put {
                id,
                container,
                bytes,
            } => {
                buf.put_u8(7);
                id.write(buf);
                container.write(buf);
                bytes.write(buf);
            }
            Self::PushQuery {
                id,
                deadline,
                container,
                bytes,
            } => {
                buf.put_u8(8);
                id.write(buf);
                deadline.write(buf);
                container.write(buf);
                bytes.write(buf);
            }
            Self::PullQuery {
                id,
                deadline,
                container,
            } => {
                buf.put_u8(9);
                id.write(buf);
                deadline.write(buf);
                container.write(buf);
            }
            Self::Chits { id, votes } => {
                buf.put_u8(10);
                id.write(buf);
                votes.write(buf);
            }
            Self::AppRequest {
                id,
                deadline,
                payload,
            } => {
                buf.put_u8(11);
                id.write(buf);
                deadline.write(buf);
                payload.write(buf);
            }
            Self::AppResponse { id, payload } => {
                buf.put_u8(12);
                id.write(buf);
                payload.write(buf);
            }
            Self::AppGossip { payload } => {
                buf.put_u8(13);
                payload.write(buf);
            }
        }
    }
}

impl<D: Digest> EncodeSize for Message<D> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::GetAcceptedFrontier { id, deadline } => {
                id.encode_size() + deadline.encode_size()
            }
            Self::AcceptedFrontier { id, containers } => {
                id.encode_size() + containers.encode_size()
            }
            Self::GetAccepted {
                id,
                deadline,
                containers,
            } => id.encode_size() + deadline.encode_size() + containers.encode_size(),
            Self::Accepted { id, containers } => id.encode_size() + containers.encode_size(),
            Self::GetAncestors {
                id,
                deadline,
                container,
            } => id.encode_size() + deadline.encode_size() + container.encode_size(),
            Self::MultiPut { id, containers } => id.encode_size() + containers.encode_size(),
            Self::Get {
                id,
                deadline,
                container,
            } => id.encode_size() + deadline.encode_size() + container.encode_size(),
            Self::Put {
                id,
                container,
                bytes,
            } => id.encode_size() + container.encode_size() + bytes.encode_size(),
            Self::PushQuery {
                id,
                deadline,
                container,
                bytes,
            } => {
                id.encode_size()
                    + deadline.encode_size()
                    + container.encode_size()
                    + bytes.encode_size()
            }
            Self::PullQuery {
                id,
                deadline,
                container,
            } => id.encode_size() + deadline.encode_size() + container.encode_size(),
            Self::Chits { id, votes } => id.encode_size() + votes.encode_size(),
            Self::AppRequest {
                id,
                deadline,
                payload,
            } => id.encode_size() + deadline.encode_size() + payload.encode_size(),
            Self::AppResponse { id, payload } => id.encode_size() + payload.encode_size(),
            Self::AppGossip { payload } => payload.encode_size(),
        }
    }
}

impl<D: Digest> Read for Message<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let ids_cfg = ((..=MAX_CONTAINER_IDS).into(), ());
        let tag = u8::read(buf)?;
        match tag {
            0 => {
                let id = RequestId::read(buf)?;
                let deadline = u64::read(buf)?;
                Ok(Self::GetAcceptedFrontier { id, deadline })
            }
            1 => {
                let id = RequestId::read(buf)?;
                let containers = Vec::<D>::read_cfg(buf, &ids_cfg)?;
                Ok(Self::AcceptedFrontier { id, containers })
            }
            2 => {
                let id = RequestId::read(buf)?;
                let deadline = u64::read(buf)?;
                let containers = Vec::<D>::read_cfg(buf, &ids_cfg)?;
                Ok(Self::GetAccepted {
                    id,
                    deadline,
                    containers,
                })
            }
            3 => {
                let id = RequestId::read(buf)?;
                let containers = Vec::<D>::read_cfg(buf, &ids_cfg)?;
                Ok(Self::Accepted { id, containers })
            }
            4 => {
                let id = RequestId::read(buf)?;
                let deadline = u64::read(buf)?;
                let container = D::read(buf)?;
                Ok(Self::GetAncestors {
                    id,
                    deadline,
                    container,
                })
            }
            5 => {
                let id = RequestId::read(buf)?;
                let containers = Vec::<Bytes>::read_cfg(
                    buf,
                    &((..=MAX_CONTAINERS_PER_MULTIPUT).into(), (..).into()),
                )?;
                Ok(Self::MultiPut { id, containers })
            }
            6 => {
                let id = RequestId::read(buf)?;
                let deadline = u64::read(buf)?;
                let container = D::read(buf)?;
                Ok(Self::Get {
                    id,
                    deadline,
                    container,
                })
            }
            7 => {
                let id = RequestId::read(buf)?;
                let container = D::read(buf)?;
                let bytes = Bytes::read_cfg(buf, &(..).into())?;
                Ok(Self::Put {
                    id,
                    container,
                    bytes,
                })
            }
            8 => {
                let id = RequestId::read(buf)?;
                let deadline = u64::read(buf)?;
                let container = D::read(buf)?;
                let bytes = Bytes::read_cfg(buf, &(..).into())?;
                Ok(Self::PushQuery {
                    id,
                    deadline,
                    container,
                    bytes,
                })
            }
            9 => {
                let id = RequestId::read(buf)?;
                let deadline = u64::read(buf)?;
                let container = D::read(buf)?;
                Ok(Self::PullQuery {
                    id,
                    deadline,
                    container,
                })
            }
            10 => {
                let id = RequestId::read(buf)?;
                let votes = Vec::<D>::read_cfg(buf, &ids_cfg)?;
                Ok(Self::Chits { id, votes })
            }
            11 => {
                let id = RequestId::read(buf)?;
                let deadline = u64::read(buf)?;
                let payload = Bytes::read_cfg(buf, &(..).into())?;
                Ok(Self::AppRequest {
                    id,
                    deadline,
                    payload,
                })
            }
            12 => {
                let id = RequestId::read(buf)?;
                let payload = Bytes::read_cfg(buf, &(..).into())?;
                Ok(Self::AppResponse { id, payload })
            }
            13 => {
                let payload = Bytes::read_cfg(buf, &(..).into())?;
                Ok(Self::AppGossip { payload })
            }
            _ => Err(CodecError::Invalid("Message", "invalid tag")),
        }
    }
}
