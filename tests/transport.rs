use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mockable::DefaultClock;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use lessond::engine::Engine;
use lessond::notify::{Dispatcher, NotifyHub};
use lessond::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("lessond_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(
        Engine::new(
            dir.join("lessond.wal"),
            Dispatcher::new(hub.clone()),
            Arc::new(DefaultClock),
        )
        .unwrap(),
    );

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            let hub = hub.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, hub).await;
            });
        }
    });

    (addr, engine)
}

/// A line-protocol client that sets pushed messages aside while waiting for replies.
struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    pushed: Vec<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr, external_id: i64) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Self {
            framed: Framed::new(stream, LinesCodec::new()),
            pushed: Vec::new(),
        };
        let reply = client
            .call(json!({"op": "identify", "external_id": external_id}))
            .await;
        assert_eq!(reply["ok"], true, "{reply}");
        client
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a line")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.framed.send(request.to_string()).await.unwrap();
        loop {
            let value = self.next_line().await;
            if value["data"]["type"] == "message" {
                self.pushed.push(value["data"]["message"].clone());
            } else {
                return value;
            }
        }
    }

    /// Next pushed message, whether it already arrived or not.
    async fn push(&mut self) -> Value {
        if !self.pushed.is_empty() {
            return self.pushed.remove(0);
        }
        loop {
            let value = self.next_line().await;
            if value["data"]["type"] == "message" {
                return value["data"]["message"].clone();
            }
            panic!("unexpected reply while waiting for a push: {value}");
        }
    }
}

async fn ok(client: &mut Client, request: Value) -> Value {
    let reply = client.call(request).await;
    assert_eq!(reply["ok"], true, "{reply}");
    reply["data"].clone()
}

async fn err_kind(client: &mut Client, request: Value) -> String {
    let reply = client.call(request).await;
    assert_eq!(reply["ok"], false, "{reply}");
    reply["error"]["kind"].as_str().unwrap().to_string()
}

const OLGA: i64 = 1001;
const ANNA: i64 = 1002;
const BORIS: i64 = 1003;

/// Organizer Olga plus counterparts Anna and Boris, all connected.
async fn setup(addr: SocketAddr) -> (Client, Client, Client, String, String) {
    let mut olga = Client::connect(addr, OLGA).await;
    ok(
        &mut olga,
        json!({"op": "register_organizer", "name": "Olga", "login": "olga"}),
    )
    .await;

    let mut anna = Client::connect(addr, ANNA).await;
    let data = ok(
        &mut anna,
        json!({"op": "register_counterpart", "organizer_login": "olga", "name": "Anna"}),
    )
    .await;
    let anna_id = data["counterpart"]["id"].as_str().unwrap().to_string();

    let mut boris = Client::connect(addr, BORIS).await;
    let data = ok(
        &mut boris,
        json!({"op": "register_counterpart", "organizer_login": "olga", "name": "Boris"}),
    )
    .await;
    let boris_id = data["counterpart"]["id"].as_str().unwrap().to_string();

    (olga, anna, boris, anna_id, boris_id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_is_announced_to_the_counterpart() {
    let (addr, _engine) = start_test_server().await;
    let (mut olga, mut anna, mut boris, anna_id, boris_id) = setup(addr).await;

    let data = ok(
        &mut olga,
        json!({"op": "create_booking", "counterpart_id": anna_id, "date": "2099-01-05", "time": "15:00"}),
    )
    .await;
    assert_eq!(data["booking"]["counterpart_name"], "Anna");

    let push = anna.push().await;
    assert_eq!(push["recipient"], ANNA);
    assert_eq!(
        push["text"],
        "You have a lesson scheduled with Olga on 2099-01-05 at 15:00."
    );

    // Same slot for Boris: the organizer is busy.
    let kind = err_kind(
        &mut olga,
        json!({"op": "create_booking", "counterpart_id": boris_id, "date": "2099-01-05", "time": "15:00"}),
    )
    .await;
    assert_eq!(kind, "slot_conflict");

    let data = ok(&mut anna, json!({"op": "upcoming"})).await;
    assert_eq!(data["bookings"].as_array().unwrap().len(), 1);
    let data = ok(&mut boris, json!({"op": "upcoming"})).await;
    assert!(data["bookings"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn reschedule_negotiation_end_to_end() {
    let (addr, engine) = start_test_server().await;
    let (mut olga, mut anna, _boris, anna_id, _) = setup(addr).await;

    let data = ok(
        &mut olga,
        json!({"op": "create_booking", "counterpart_id": anna_id, "date": "2099-01-05", "time": "15:00"}),
    )
    .await;
    let booking_id = data["booking"]["booking"]["id"].as_str().unwrap().to_string();
    anna.push().await;

    let data = ok(&mut anna, json!({"op": "start_negotiation"})).await;
    let negotiation_id = data["negotiation"]["id"].as_str().unwrap().to_string();
    assert_eq!(data["choices"].as_array().unwrap().len(), 1);

    let data = ok(
        &mut anna,
        json!({"op": "select_booking", "negotiation_id": negotiation_id, "booking_id": booking_id}),
    )
    .await;
    assert_eq!(data["state"]["awaiting_reason"]["booking_id"], booking_id.as_str());

    ok(
        &mut anna,
        json!({"op": "submit_reason", "negotiation_id": negotiation_id, "reason": "dentist"}),
    )
    .await;

    let data = ok(
        &mut anna,
        json!({"op": "propose_time", "negotiation_id": negotiation_id, "time": "17:00"}),
    )
    .await;
    assert!(data["step"]["pending"]["awaiting_organizer_decision"].is_object());

    let request = olga.push().await;
    assert_eq!(
        request["text"],
        "Student Anna requests to reschedule the lesson on 2099-01-05 from 15:00 to 17:00 for reason: dentist. Do you agree?"
    );
    let buttons = request["keyboard"]["rows"][0].as_array().unwrap();
    assert_eq!(buttons[0]["action"], "accept_reschedule");
    assert_eq!(buttons[0]["negotiation_id"], negotiation_id.as_str());
    assert_eq!(buttons[1]["action"], "decline_reschedule");

    // Only the organizer may answer.
    let kind = err_kind(
        &mut anna,
        json!({"op": "resolve_negotiation", "negotiation_id": negotiation_id, "decision": "accept"}),
    )
    .await;
    assert_eq!(kind, "not_found");

    let data = ok(
        &mut olga,
        json!({"op": "resolve_negotiation", "negotiation_id": negotiation_id, "decision": "accept"}),
    )
    .await;
    assert_eq!(data["outcome"]["accepted"]["booking"]["booking"]["time"], "17:00:00");

    let moved = anna.push().await;
    assert_eq!(
        moved["text"],
        "Your lesson with Olga has been rescheduled to 2099-01-05 at 17:00."
    );

    let data = ok(&mut olga, json!({"op": "day_schedule", "date": "2099-01-05"})).await;
    let bookings = data["bookings"].as_array().unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0]["booking"]["time"], "17:00:00");

    assert!(engine.negotiation(negotiation_id.parse().unwrap()).await.is_err());
}

#[tokio::test]
async fn declined_request_keeps_the_booking() {
    let (addr, _engine) = start_test_server().await;
    let (mut olga, mut anna, _boris, anna_id, _) = setup(addr).await;

    let data = ok(
        &mut olga,
        json!({"op": "create_booking", "counterpart_id": anna_id, "date": "2099-01-05", "time": "15:00"}),
    )
    .await;
    let booking_id = data["booking"]["booking"]["id"].as_str().unwrap().to_string();
    anna.push().await;

    let data = ok(&mut anna, json!({"op": "start_negotiation"})).await;
    let negotiation_id = data["negotiation"]["id"].as_str().unwrap().to_string();
    ok(
        &mut anna,
        json!({"op": "select_booking", "negotiation_id": negotiation_id, "booking_id": booking_id}),
    )
    .await;
    ok(
        &mut anna,
        json!({"op": "submit_reason", "negotiation_id": negotiation_id, "reason": "exam"}),
    )
    .await;
    ok(
        &mut anna,
        json!({"op": "propose_time", "negotiation_id": negotiation_id, "time": "18:00"}),
    )
    .await;
    olga.push().await;

    let data = ok(
        &mut olga,
        json!({"op": "resolve_negotiation", "negotiation_id": negotiation_id, "decision": "decline"}),
    )
    .await;
    assert_eq!(data["outcome"]["declined"]["cause"], "organizer");

    let declined = anna.push().await;
    assert_eq!(
        declined["text"],
        "Your request to reschedule the lesson with Olga was declined. The lesson stays on 2099-01-05 at 15:00."
    );

    let data = ok(&mut anna, json!({"op": "upcoming"})).await;
    assert_eq!(data["bookings"][0]["booking"]["time"], "15:00:00");
}

#[tokio::test]
async fn protocol_errors() {
    let (addr, _engine) = start_test_server().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = Client {
        framed: Framed::new(stream, LinesCodec::new()),
        pushed: Vec::new(),
    };

    assert_eq!(err_kind(&mut client, json!({"op": "upcoming"})).await, "unidentified");
    assert_eq!(err_kind(&mut client, json!({"op": "teleport"})).await, "bad_request");

    let reply = client
        .call(json!({"op": "identify", "external_id": 77}))
        .await;
    assert_eq!(reply["data"]["type"], "identified");
    assert_eq!(err_kind(&mut client, json!({"op": "upcoming"})).await, "unregistered");
    assert_eq!(
        err_kind(
            &mut client,
            json!({"op": "register_counterpart", "organizer_login": "nobody", "name": "X"})
        )
        .await,
        "unknown_login"
    );
}
