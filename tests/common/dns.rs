//! A minimal authoritative server for a single zone.
//!
//! It answers SOA queries and AXFR requests for the zone over TCP and
//! applies dynamic updates adding or deleting A records. Each update
//! increases the serial by one. A zone with a TSIG key only accepts signed
//! requests and signs its answers. Signed transfers are sent as a single
//! message.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use domain::base::iana::{Class, Opcode, Rcode};
use domain::base::message_builder::AdditionalBuilder;
use domain::base::{Message, MessageBuilder, Name, Rtype, Serial, ToName, Ttl};
use domain::rdata::tsig::Time48;
use domain::rdata::{Soa, A};
use domain::tsig::{Key, ServerTransaction};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

//------------ FakeZone ------------------------------------------------------

#[derive(Clone, Debug)]
pub struct FakeZone {
    pub apex: Name<Bytes>,
    pub serial: u32,
    pub records: Vec<(Name<Bytes>, Ipv4Addr)>,
    pub key: Option<Arc<Key>>,
}

impl FakeZone {
    pub fn new(apex: &str, serial: u32) -> Self {
        FakeZone {
            apex: Name::bytes_from_str(apex).unwrap(),
            serial,
            records: Vec::new(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn with_record(mut self, owner: &str, addr: Ipv4Addr) -> Self {
        self.records
            .push((Name::bytes_from_str(owner).unwrap(), addr));
        self
    }

    fn soa(&self) -> (Name<Bytes>, u32, Soa<Name<Bytes>>) {
        let ttl = Ttl::from_secs(3600);
        (
            self.apex.clone(),
            3600,
            Soa::new(
                Name::bytes_from_str("ns.invalid.").unwrap(),
                Name::bytes_from_str("hostmaster.invalid.").unwrap(),
                Serial(self.serial),
                ttl,
                ttl,
                ttl,
                ttl,
            ),
        )
    }
}

//------------ FakeDnsServer -------------------------------------------------

pub struct FakeDnsServer {
    pub addr: SocketAddr,
    pub zone: Arc<Mutex<FakeZone>>,

    /// The number of requests with a valid signature.
    pub signed: Arc<AtomicUsize>,
}

impl FakeDnsServer {
    /// Starts serving `zone` on a random local port.
    pub async fn start(zone: FakeZone) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let zone = Arc::new(Mutex::new(zone));
        let signed = Arc::new(AtomicUsize::new(0));
        let served = zone.clone();
        let counter = signed.clone();
        tokio::spawn(async move {
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                tokio::spawn(handle(sock, served.clone(), counter.clone()));
            }
        });
        FakeDnsServer { addr, zone, signed }
    }

    pub fn signed(&self) -> usize {
        self.signed.load(Ordering::Relaxed)
    }

    pub fn serial(&self) -> u32 {
        self.zone.lock().unwrap().serial
    }

    pub fn records(&self) -> Vec<(Name<Bytes>, Ipv4Addr)> {
        self.zone.lock().unwrap().records.clone()
    }
}

/// How the answer to a request is signed.
enum Signer {
    Unsigned,
    Rejected,
    Signed(ServerTransaction<Arc<Key>>),
}

impl Signer {
    fn new(key: Option<Arc<Key>>, request: &mut Message<Vec<u8>>) -> Self {
        let Some(key) = key else {
            return Signer::Unsigned;
        };
        match ServerTransaction::request(&key, request, Time48::now()) {
            Ok(Some(tran)) => Signer::Signed(tran),
            _ => Signer::Rejected,
        }
    }
}

async fn handle(
    mut sock: TcpStream,
    zone: Arc<Mutex<FakeZone>>,
    signed: Arc<AtomicUsize>,
) {
    let len = sock.read_u16().await.unwrap();
    let mut buf = vec![0; usize::from(len)];
    sock.read_exact(&mut buf).await.unwrap();
    let mut request = Message::from_octets(buf).unwrap();
    let key = zone.lock().unwrap().key.clone();
    let signer = Signer::new(key, &mut request);
    let responses = match signer {
        Signer::Unsigned => respond(&request, &mut zone.lock().unwrap(), true),
        Signer::Rejected => {
            let answer = MessageBuilder::new_vec()
                .start_answer(&request, Rcode::NOTAUTH)
                .unwrap();
            vec![answer.additional()]
        }
        Signer::Signed(tran) => {
            signed.fetch_add(1, Ordering::Relaxed);
            let mut responses =
                respond(&request, &mut zone.lock().unwrap(), false);
            tran.answer(&mut responses[0], Time48::now()).unwrap();
            responses
        }
    };
    for response in responses {
        let response = response.finish();
        let len = u16::try_from(response.len()).unwrap();
        sock.write_all(&len.to_be_bytes()).await.unwrap();
        sock.write_all(&response).await.unwrap();
    }
    sock.flush().await.unwrap();
}

/// Builds the answers to `request`.
///
/// Transfers are split into two messages if `split` is set.
fn respond(
    request: &Message<Vec<u8>>,
    zone: &mut FakeZone,
    split: bool,
) -> Vec<AdditionalBuilder<Vec<u8>>> {
    let builder = || MessageBuilder::new_vec();

    if request.header().opcode() == Opcode::UPDATE {
        for record in request.authority().unwrap().limit_to::<A>() {
            let record = record.unwrap();
            let owner =
                Name::bytes_from_str(&record.owner().to_string()).unwrap();
            let addr = record.data().addr();
            if record.class() == Class::NONE {
                zone.records.retain(|item| *item != (owner.clone(), addr));
            } else {
                zone.records.push((owner, addr));
            }
        }
        zone.serial += 1;
        let answer = builder().start_answer(request, Rcode::NOERROR).unwrap();
        return vec![answer.additional()];
    }

    let question = request.first_question().unwrap();
    if !question.qname().name_eq(&zone.apex) {
        let answer = builder().start_answer(request, Rcode::REFUSED).unwrap();
        return vec![answer.additional()];
    }
    match question.qtype() {
        Rtype::SOA => {
            let mut answer =
                builder().start_answer(request, Rcode::NOERROR).unwrap();
            answer.push(zone.soa()).unwrap();
            vec![answer.additional()]
        }
        Rtype::AXFR => {
            let mut first =
                builder().start_answer(request, Rcode::NOERROR).unwrap();
            first.push(zone.soa()).unwrap();
            for (owner, addr) in &zone.records {
                first.push((owner, 3600, A::new(*addr))).unwrap();
            }
            if !split {
                first.push(zone.soa()).unwrap();
                return vec![first.additional()];
            }
            let mut last =
                builder().start_answer(request, Rcode::NOERROR).unwrap();
            last.push(zone.soa()).unwrap();
            vec![first.additional(), last.additional()]
        }
        _ => {
            let answer =
                builder().start_answer(request, Rcode::NOTIMP).unwrap();
            vec![answer.additional()]
        }
    }
}
