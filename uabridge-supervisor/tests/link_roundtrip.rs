//! Drives the link against an in-process fake supervisor over loopback TCP.
//!
//! The configured OPC UA endpoint points at a port nothing listens on, so
//! every path that reaches the network fails fast with `OpcReject` while the
//! pre-dispatch checks surface their own tokens.

use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use uabridge_engine::{ConfigPersist, OpcEngine};
use uabridge_error::BridgeResult;
use uabridge_model::{ConfigDocument, ConfigStore};
use uabridge_supervisor::{BatcherSink, Dispatcher, ProgressForwarder, SupervisorLink, TransIdGen};

struct NoPersist;

impl ConfigPersist for NoPersist {
    fn persist(&self) -> BridgeResult<()> {
        Ok(())
    }
}

fn document(port: u16) -> ConfigDocument {
    serde_json::from_value(serde_json::json!({
        "driver": {
            "uid": "bridge-under-test",
            "host": "127.0.0.1",
            "port": port,
            "version": "1.0.0"
        },
        "devices": {
            "d1": {
                "name": "Sim",
                "options": {
                    "endpointUrl": {"currentValue": "opc.tcp://127.0.0.1:1"}
                },
                "tags": {
                    "1": {
                        "name": "t1",
                        "type": "float",
                        "options": {
                            "nodeId": {"currentValue": "ns=2;s=T1"},
                            "nodeType": {"currentValue": 11},
                            "arrayIndex": {"currentValue": -1}
                        }
                    },
                    "2": {
                        "name": "ro",
                        "type": "int",
                        "read": true,
                        "write": false,
                        "options": {
                            "nodeId": {"currentValue": "ns=2;s=RO"},
                            "nodeType": {"currentValue": 6},
                            "arrayIndex": {"currentValue": -1}
                        }
                    }
                }
            }
        }
    }))
    .expect("test document parses")
}

async fn recv_frame(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Value {
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("frame within deadline")
        .expect("socket readable");
    serde_json::from_str(line.trim_end()).expect("frame is one JSON object per line")
}

#[tokio::test]
async fn handshake_then_command_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let store = ConfigStore::from_document("unused.json", document(port));
    let driver = store.driver_settings();
    let cancel = CancellationToken::new();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (change_tx, _change_rx) = mpsc::unbounded_channel();
    let ids = Arc::new(TransIdGen::new());
    let progress = Arc::new(ProgressForwarder::new(out_tx.clone()));
    let engine = OpcEngine::new(
        store,
        Arc::new(BatcherSink::new(change_tx)),
        progress,
        Arc::new(NoPersist),
        cancel.child_token(),
    );
    let dispatcher = Arc::new(Dispatcher::new(engine, ids, out_tx));
    let link = SupervisorLink::new(driver, dispatcher, out_rx, cancel.child_token());
    let link_task = tokio::spawn(link.run());

    let (socket, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("driver dials in")
        .unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let handshake = recv_frame(&mut reader).await;
    assert_eq!(handshake["cmd"], "connect");
    assert_eq!(handshake["uid"], "bridge-under-test");
    assert_eq!(handshake["transID"], 0);

    // pingDevice on a device with no connection: active=false immediately
    write_half
        .write_all(b"{\"cmd\":\"pingDevice\",\"transID\":3,\"uid\":\"d1\"}\n")
        .await
        .unwrap();
    let reply = recv_frame(&mut reader).await;
    assert_eq!(reply["cmd"], "pingDevice");
    assert_eq!(reply["transID"], 3);
    assert_eq!(reply["active"], false);

    // unknown device fails pre-dispatch
    write_half
        .write_all(b"{\"cmd\":\"getTagsValues\",\"transID\":4,\"deviceUid\":\"ghost\",\"tags\":[\"t1\"]}\n")
        .await
        .unwrap();
    let reply = recv_frame(&mut reader).await;
    assert_eq!(reply["transID"], 4);
    assert_eq!(reply["errorTxt"], "DeviceIdNotFound");

    // write=false is rejected before any OPC UA traffic
    write_half
        .write_all(b"{\"cmd\":\"setTagsValues\",\"transID\":5,\"deviceUid\":\"d1\",\"tags\":[{\"ro\":1}]}\n")
        .await
        .unwrap();
    let reply = recv_frame(&mut reader).await;
    assert_eq!(reply["transID"], 5);
    assert_eq!(reply["errorTxt"], "TagNotWriteable");

    // a read that needs the (unreachable) server surfaces the connect reject
    write_half
        .write_all(b"{\"cmd\":\"getTagsValues\",\"transID\":6,\"deviceUid\":\"d1\",\"tags\":[\"t1\"]}\n")
        .await
        .unwrap();
    let reply = recv_frame(&mut reader).await;
    assert_eq!(reply["transID"], 6);
    assert_eq!(reply["errorTxt"], "OpcReject");

    cancel.cancel();
    let _ = timeout(Duration::from_secs(5), link_task).await;
}
