//! DNS over TCP exchanges with the servers under test.
//!
//! The scenario talks to the servers only for observing and changing zone
//! content: it asks for SOA serials, transfers zones via AXFR and sends
//! dynamic updates. All of this happens over plain TCP on each server's
//! query address using the length-prefixed framing of RFC 1035. The
//! encrypted transfers between the servers themselves are not touched.
//!
//! Servers commonly only allow transfers and updates signed with a TSIG
//! key. If a key is given, requests are signed with it and successful
//! answers must carry a valid signature. Error answers are taken as they
//! are.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use std::{fmt, io};

use domain::base::iana::{Class, Opcode, Rcode};
use domain::base::message_builder::{AdditionalBuilder, PushError};
use domain::base::name::ParsedName;
use domain::base::wire::ParseError;
use domain::base::{Message, MessageBuilder, Rtype, Serial, ToName, Ttl};
use domain::rdata::tsig::Time48;
use domain::rdata::{Soa, ZoneRecordData, A};
use domain::tsig::{ClientSequence, ClientTransaction, Key, ValidationError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::zone::ZoneName;

//------------ Constants -----------------------------------------------------

/// Upper bound for a complete exchange including connection setup.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// TTL of the records added by dynamic updates.
const UPDATE_TTL: Ttl = Ttl::from_secs(3600);

//------------ Connection ----------------------------------------------------

/// A TCP connection to a server's query address.
struct Connection {
    sock: TcpStream,
    addr: SocketAddr,
}

impl Connection {
    async fn connect(addr: SocketAddr) -> Result<Self, WireError> {
        let sock = TcpStream::connect(addr).await?;
        Ok(Connection { sock, addr })
    }

    async fn send(&mut self, msg: &[u8]) -> Result<(), WireError> {
        let len = u16::try_from(msg.len())
            .map_err(|_| WireError::LongMessage)?;
        trace!("Sending {} octets to {}", msg.len(), self.addr);
        self.sock.write_all(&len.to_be_bytes()).await?;
        self.sock.write_all(msg).await?;
        self.sock.flush().await?;
        Ok(())
    }

    /// Receives the next response and checks it.
    ///
    /// The response must have the request's ID and a NOERROR RCODE, and
    /// pass the signature check of `signer`.
    async fn recv(
        &mut self,
        id: u16,
        signer: &mut Signer<'_>,
    ) -> Result<Message<Vec<u8>>, WireError> {
        let len = usize::from(self.sock.read_u16().await?);
        let mut buf = vec![0; len];
        self.sock.read_exact(&mut buf).await?;
        let mut msg =
            Message::from_octets(buf).map_err(|_| WireError::ShortMessage)?;
        trace!("Received {len} octets from {}", self.addr);
        if msg.header().id() != id {
            return Err(WireError::IdMismatch);
        }
        let rcode = msg.header().rcode();
        if rcode != Rcode::NOERROR {
            return Err(WireError::Rcode(rcode));
        }
        signer.check(&mut msg)?;
        Ok(msg)
    }
}

//------------ Signer --------------------------------------------------------

/// The TSIG state of an exchange.
enum Signer<'a> {
    Unsigned,

    /// A request with a single answer.
    Transaction(ClientTransaction<&'a Key>),

    /// A request answered by a sequence of messages, i.e., AXFR.
    Sequence(ClientSequence<&'a Key>),
}

impl<'a> Signer<'a> {
    /// Completes `msg` and signs it if there is a key.
    fn single(
        key: Option<&'a Key>,
        mut msg: AdditionalBuilder<Vec<u8>>,
    ) -> Result<(Self, Vec<u8>), WireError> {
        let res = match key {
            Some(key) => Signer::Transaction(ClientTransaction::request(
                key,
                &mut msg,
                Time48::now(),
            )?),
            None => Signer::Unsigned,
        };
        Ok((res, msg.finish()))
    }

    /// Completes `msg` for a multi-message answer and signs it.
    fn sequence(
        key: Option<&'a Key>,
        mut msg: AdditionalBuilder<Vec<u8>>,
    ) -> Result<(Self, Vec<u8>), WireError> {
        let res = match key {
            Some(key) => Signer::Sequence(ClientSequence::request(
                key,
                &mut msg,
                Time48::now(),
            )?),
            None => Signer::Unsigned,
        };
        Ok((res, msg.finish()))
    }

    /// Checks the signature of an answer and removes it.
    fn check(&mut self, msg: &mut Message<Vec<u8>>) -> Result<(), WireError> {
        match self {
            Signer::Unsigned => Ok(()),
            Signer::Transaction(tran) => Ok(tran.answer(msg, Time48::now())?),
            Signer::Sequence(seq) => Ok(seq.answer(msg, Time48::now())?),
        }
    }

    /// Checks that the answer sequence ended with a signed message.
    fn done(self) -> Result<(), WireError> {
        match self {
            Signer::Sequence(seq) => Ok(seq.done()?),
            _ => Ok(()),
        }
    }
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, WireError>>,
) -> Result<T, WireError> {
    tokio::time::timeout(EXCHANGE_TIMEOUT, fut)
        .await
        .map_err(|_| WireError::Timeout)?
}

//------------ query_soa_serial ----------------------------------------------

/// Asks the server at `addr` for the serial of the zone at `apex`.
pub async fn query_soa_serial(
    addr: SocketAddr,
    apex: &impl ToName,
    key: Option<&Key>,
) -> Result<Serial, WireError> {
    let id = rand::random();
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_id(id);
    let mut msg = msg.question();
    msg.push((apex, Rtype::SOA))?;
    let (mut signer, request) = Signer::single(key, msg.additional())?;

    with_timeout(async {
        let mut conn = Connection::connect(addr).await?;
        conn.send(&request).await?;
        let response = conn.recv(id, &mut signer).await?;
        let answer = response.answer()?;
        let mut records = answer.limit_to::<Soa<_>>();
        match records.next() {
            Some(record) => Ok(record?.data().serial()),
            None => Err(WireError::MissingSoa),
        }
    })
    .await
}

//------------ axfr ----------------------------------------------------------

/// The content of a zone as received via AXFR.
#[derive(Clone, Debug)]
pub struct ZoneContent {
    /// The serial of the SOA record opening the transfer.
    pub serial: Serial,

    /// All records but the SOA in presentation format.
    pub records: BTreeSet<String>,
}

/// Transfers the zone at `apex` from the server at `addr`.
pub async fn axfr(
    addr: SocketAddr,
    apex: &impl ToName,
    key: Option<&Key>,
) -> Result<ZoneContent, WireError> {
    let id = rand::random();
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_id(id);
    let mut msg = msg.question();
    msg.push((apex, Rtype::AXFR))?;
    let (mut signer, request) = Signer::sequence(key, msg.additional())?;

    let content = with_timeout(async {
        let mut conn = Connection::connect(addr).await?;
        conn.send(&request).await?;

        let mut serial = None;
        let mut records = BTreeSet::new();
        loop {
            let response = conn.recv(id, &mut signer).await?;
            let answer = response.answer()?;
            let records_in_msg =
                answer.limit_to::<ZoneRecordData<_, ParsedName<_>>>();
            for record in records_in_msg {
                let record = record?;
                if let ZoneRecordData::Soa(soa) = record.data() {
                    // The transfer ends with a repeat of the opening SOA.
                    if let Some(serial) = serial {
                        return Ok(ZoneContent { serial, records });
                    }
                    serial = Some(soa.serial());
                } else if serial.is_none() {
                    return Err(WireError::MissingSoa);
                } else {
                    records.insert(record.to_string());
                }
            }
        }
    })
    .await?;
    signer.done()?;
    Ok(content)
}

//------------ update --------------------------------------------------------

/// A single change of a dynamic update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Change {
    /// Adds an A record.
    Add(ZoneName, Ipv4Addr),

    /// Deletes a single A record.
    Delete(ZoneName, Ipv4Addr),
}

/// Sends a dynamic update with `changes` for the zone at `apex`.
///
/// The update carries no prerequisites. It succeeds if the server answers
/// with NOERROR.
pub async fn update(
    addr: SocketAddr,
    apex: &impl ToName,
    changes: &[Change],
    key: Option<&Key>,
) -> Result<(), WireError> {
    let id = rand::random();
    let mut msg = MessageBuilder::new_vec();
    msg.header_mut().set_id(id);
    msg.header_mut().set_opcode(Opcode::UPDATE);

    // RFC 2136: the question section is the zone section.
    let mut msg = msg.question();
    msg.push((apex, Rtype::SOA))?;

    // The authority section is the update section.
    let mut msg = msg.authority();
    for change in changes {
        match change {
            Change::Add(owner, ip) => {
                msg.push((owner, Class::IN, UPDATE_TTL, A::new(*ip)))?
            }
            Change::Delete(owner, ip) => {
                msg.push((owner, Class::NONE, Ttl::ZERO, A::new(*ip)))?
            }
        }
    }
    let (mut signer, request) = Signer::single(key, msg.additional())?;

    with_timeout(async {
        let mut conn = Connection::connect(addr).await?;
        conn.send(&request).await?;
        conn.recv(id, &mut signer).await?;
        Ok(())
    })
    .await
}

//------------ WireError -----------------------------------------------------

/// An exchange with a server failed.
#[derive(Debug)]
pub enum WireError {
    Io(io::Error),
    Timeout,
    Push(PushError),
    LongMessage,
    ShortMessage,
    Parse(ParseError),
    IdMismatch,
    Rcode(Rcode),
    MissingSoa,
    Tsig(ValidationError),
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        WireError::Io(err)
    }
}

impl From<PushError> for WireError {
    fn from(err: PushError) -> Self {
        WireError::Push(err)
    }
}

impl From<ValidationError> for WireError {
    fn from(err: ValidationError) -> Self {
        WireError::Tsig(err)
    }
}

impl From<ParseError> for WireError {
    fn from(err: ParseError) -> Self {
        WireError::Parse(err)
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Io(err) => write!(f, "{err}"),
            WireError::Timeout => f.write_str("timed out"),
            WireError::Push(err) => write!(f, "cannot build request: {err}"),
            WireError::LongMessage => f.write_str("request too long"),
            WireError::ShortMessage => f.write_str("short message"),
            WireError::Parse(err) => write!(f, "malformed response: {err}"),
            WireError::IdMismatch => f.write_str("response ID mismatch"),
            WireError::Rcode(rcode) => write!(f, "server answered {rcode}"),
            WireError::MissingSoa => f.write_str("no SOA record in answer"),
            WireError::Tsig(err) => write!(f, "bad TSIG signature: {err}"),
        }
    }
}

impl std::error::Error for WireError {}
