//! DNS exchange client.
//!
//! One query, one server, one deadline. UDP uses a connected socket and an
//! EDNS-sized receive buffer; TCP uses the standard two-byte length
//! framing. Truncation handling (retry over TCP) is the caller's job
//! because it also needs to update its cache key and logs.

use std::net::SocketAddr;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use sixgate_core::{SixgateError, SixgateResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};

/// Which transport to exchange over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Stateless exchanger carrying only the advertised EDNS buffer size.
#[derive(Debug, Clone, Copy)]
pub struct DnsExchange {
    pub edns_buffer_size: u16,
}

impl DnsExchange {
    pub fn new(edns_buffer_size: u16) -> Self {
        Self { edns_buffer_size }
    }

    /// Build a single-question query message.
    ///
    /// `recursion_desired` must only be set for the configured upstream
    /// resolver; every other exchange in the system is iterative.
    pub fn make_query(&self, name: Name, rtype: RecordType, recursion_desired: bool) -> Message {
        let mut msg = Message::new();
        msg.set_id(rand::random());
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(recursion_desired);
        msg.add_query(Query::query(name, rtype));
        msg.extensions_mut()
            .get_or_insert_with(Edns::new)
            .set_max_payload(self.edns_buffer_size);
        msg
    }

    /// Send `query` to `server` and await the matching response.
    pub async fn exchange(
        &self,
        query: &Message,
        server: SocketAddr,
        transport: Transport,
        deadline: Instant,
    ) -> SixgateResult<Message> {
        let payload = query
            .to_vec()
            .map_err(|e| SixgateError::Proto(format!("encode query: {e}")))?;
        match transport {
            Transport::Udp => self.exchange_udp(query.id(), &payload, server, deadline).await,
            Transport::Tcp => self.exchange_tcp(query.id(), &payload, server, deadline).await,
        }
    }

    async fn exchange_udp(
        &self,
        id: u16,
        payload: &[u8],
        server: SocketAddr,
        deadline: Instant,
    ) -> SixgateResult<Message> {
        let bind: SocketAddr = if server.is_ipv6() {
            "[::]:0".parse().expect("literal addr")
        } else {
            "0.0.0.0:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;

        timeout_at(deadline, socket.send(payload))
            .await
            .map_err(|_| SixgateError::Timeout)??;

        let mut buf = vec![0u8; (self.edns_buffer_size as usize).max(512)];
        loop {
            let n = timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| SixgateError::Timeout)??;
            let msg = match Message::from_vec(&buf[..n]) {
                Ok(msg) => msg,
                Err(_) => continue, // garbage datagram; keep waiting
            };
            if msg.id() == id {
                return Ok(msg);
            }
        }
    }

    async fn exchange_tcp(
        &self,
        id: u16,
        payload: &[u8],
        server: SocketAddr,
        deadline: Instant,
    ) -> SixgateResult<Message> {
        if payload.len() > u16::MAX as usize {
            return Err(SixgateError::Proto("query exceeds TCP frame limit".into()));
        }

        let mut stream = timeout_at(deadline, TcpStream::connect(server))
            .await
            .map_err(|_| SixgateError::Timeout)??;

        let mut framed = Vec::with_capacity(2 + payload.len());
        framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        framed.extend_from_slice(payload);
        timeout_at(deadline, stream.write_all(&framed))
            .await
            .map_err(|_| SixgateError::Timeout)??;

        let mut len_buf = [0u8; 2];
        timeout_at(deadline, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| SixgateError::Timeout)??;
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut resp = vec![0u8; len];
        timeout_at(deadline, stream.read_exact(&mut resp))
            .await
            .map_err(|_| SixgateError::Timeout)??;

        let msg = Message::from_vec(&resp)
            .map_err(|e| SixgateError::Proto(format!("decode response: {e}")))?;
        if msg.id() != id {
            return Err(SixgateError::Proto("response id mismatch".into()));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::NS;
    use hickory_proto::rr::{RData, Record};
    use std::time::Duration;

    /// Answer one UDP query with scripted NS records, then exit.
    async fn one_shot_udp_ns_server(names: Vec<&'static str>, authoritative: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();

            let mut resp = Message::new();
            resp.set_id(query.id());
            resp.set_message_type(MessageType::Response);
            resp.set_op_code(OpCode::Query);
            resp.set_response_code(ResponseCode::NoError);
            resp.set_authoritative(authoritative);
            resp.add_queries(query.queries().to_vec());
            for name in names {
                let owner = query.queries()[0].name().clone();
                let ns = Name::from_ascii(name).unwrap();
                resp.add_answer(Record::from_rdata(owner, 300, RData::NS(NS(ns))));
            }
            let bytes = resp.to_vec().unwrap();
            socket.send_to(&bytes, peer).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn udp_round_trip() {
        let server = one_shot_udp_ns_server(vec!["ns1.example.org."], true).await;
        let exchange = DnsExchange::new(1232);
        let query = exchange.make_query(
            Name::from_ascii("example.org.").unwrap(),
            RecordType::NS,
            false,
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        let resp = exchange
            .exchange(&query, server, Transport::Udp, deadline)
            .await
            .unwrap();
        assert_eq!(resp.id(), query.id());
        assert!(resp.authoritative());
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn udp_times_out_without_server() {
        let exchange = DnsExchange::new(1232);
        let query = exchange.make_query(
            Name::from_ascii("example.org.").unwrap(),
            RecordType::NS,
            false,
        );
        // nothing listens here; rely on the deadline
        let server: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let deadline = Instant::now() + Duration::from_millis(100);
        let err = exchange
            .exchange(&query, server, Transport::Udp, deadline)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SixgateError::Timeout | SixgateError::Io(_)
        ));
    }

    #[test]
    fn query_carries_edns_size() {
        let exchange = DnsExchange::new(1400);
        let query = exchange.make_query(
            Name::from_ascii("example.org.").unwrap(),
            RecordType::NS,
            true,
        );
        assert!(query.recursion_desired());
        assert_eq!(
            query.extensions().as_ref().map(|e| e.max_payload()),
            Some(1400)
        );
    }
}
