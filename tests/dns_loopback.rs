use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use cntdns::discovery::{propose, DiscoverySettings, COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL};
use cntdns::dns_server::{CntDns, DnsServer};
use cntdns::reconcile::reconcile;
use cntdns::types::{ContainerInfo, ExposedPort, Inventory, NetworkAttachment, NetworkInfo};
use cntdns::{Registry, RegistryHandle};
use hickory_server::proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_server::proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const LB: &str = "127.0.1.99";

fn shop_inventory() -> Inventory {
    Inventory {
        containers: vec![ContainerInfo {
            id: "c1".into(),
            names: vec!["/api-1".into()],
            labels: HashMap::from([
                (COMPOSE_PROJECT_LABEL.to_string(), "shop".to_string()),
                (COMPOSE_SERVICE_LABEL.to_string(), "api".to_string()),
            ]),
            ports: vec![ExposedPort::tcp(8080)],
            networks: vec![NetworkAttachment {
                network_id: "br".into(),
                ip: Some("172.18.0.5".parse().unwrap()),
            }],
        }],
        networks: vec![NetworkInfo {
            id: "br".into(),
            driver: "bridge".into(),
        }],
    }
}

async fn start_server() -> SocketAddr {
    let proposals = propose(&shop_inventory(), &DiscoverySettings::new("cnt.local"));
    let registry = reconcile(&Registry::empty("cnt.local"), &proposals, &[]).registry;
    let handle = RegistryHandle::new(Registry::empty("cnt.local"));
    assert!(handle.publish(registry));

    let handler = CntDns::new(handle, LB.parse().unwrap(), 1);
    let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), handler)
        .await
        .unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());
    addr
}

async fn ask(server: SocketAddr, name: &str, query_type: RecordType) -> Message {
    let mut query = Message::new();
    query
        .set_id(4242)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    query.add_query(Query::query(Name::from_ascii(name).unwrap(), query_type));

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&query.to_vec().unwrap(), server)
        .await
        .unwrap();

    let mut buf = [0u8; 4096];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no DNS response")
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

#[tokio::test]
async fn unknown_name_answers_with_txt_not_nxdomain() {
    let server = start_server().await;
    let response = ask(server, "unknown.cnt.local.", RecordType::A).await;

    assert_eq!(response.id(), 4242);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);

    let record = &response.answers()[0];
    assert_eq!(record.record_type(), RecordType::TXT);
    let Some(RData::TXT(txt)) = record.data() else {
        panic!("expected TXT data, got {:?}", record.data());
    };
    let text: String = txt
        .txt_data()
        .iter()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();
    assert!(text.contains("unknown.cnt.local"), "{text}");
}

#[tokio::test]
async fn container_names_answer_with_addresses() {
    let server = start_server().await;

    for name in ["api.cnt.local.", "api-1.cnt.local.", "api.shop.cnt.local."] {
        let response = ask(server, name, RecordType::A).await;
        let record = &response.answers()[0];
        assert_eq!(record.ttl(), 1);
        assert_eq!(
            record.data().and_then(|data| data.ip_addr()),
            Some("172.18.0.5".parse::<IpAddr>().unwrap()),
            "{name}"
        );
    }

    let response = ask(server, "api.shop.lb.cnt.local.", RecordType::A).await;
    assert_eq!(
        response.answers()[0].data().and_then(|data| data.ip_addr()),
        Some(LB.parse::<IpAddr>().unwrap())
    );
}

#[tokio::test]
async fn address_family_mismatch_is_empty_noerror() {
    let server = start_server().await;
    let response = ask(server, "api.cnt.local.", RecordType::AAAA).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());
}
