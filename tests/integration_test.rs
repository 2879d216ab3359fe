//! End-to-end scenarios over real sockets: acceptor + manager + router wired
//! together the same way `server::run` does, minus the signal handling.

use parlor::Message;
use parlor::connection::{ClientConnection, ConnectionManager};
use parlor::core::gateway::CommandGateway;
use parlor::core::pool::WorkerPool;
use parlor::core::registry::ClientRegistry;
use parlor::core::router::{
    BroadcastRouter, IncomingCommandStrategy, gateway_strategy, unsupported_commands_strategy,
};
use parlor::core::protocol::SYSTEM_SENDER;
use parlor::server::ClientAcceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WELCOME: &str = "Welcome to the chat!";

struct TestServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    // Dropping the pool would abort the event workers mid-test.
    _pool: WorkerPool,
    manager: Arc<ConnectionManager>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn start_server(strategy: IncomingCommandStrategy) -> TestServer {
    start_server_with_workers(strategy, 4).await
}

async fn start_server_with_workers(strategy: IncomingCommandStrategy, workers: usize) -> TestServer {
    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::spawn(workers, &shutdown_tx);

    let registry = Arc::new(ClientRegistry::new());
    let manager = ConnectionManager::new(registry, pool.handle(), shutdown_tx.clone());
    let _router = BroadcastRouter::attach(&manager, WELCOME.to_string(), strategy);

    let acceptor = ClientAcceptor::bind("127.0.0.1", 0).await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    {
        let manager = manager.clone();
        acceptor.on_accepted(move |conn| manager.on_accepted(conn));
    }

    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let _ = acceptor.listen(shutdown_rx).await;
    });

    TestServer {
        addr,
        shutdown_tx,
        _pool: pool,
        manager,
    }
}

async fn connect(server: &TestServer) -> ClientConnection {
    ClientConnection::connect("127.0.0.1", server.addr.port())
        .await
        .unwrap()
}

async fn recv(conn: &ClientConnection) -> Message {
    timeout(Duration::from_secs(5), conn.read_message())
        .await
        .expect("timed out waiting for a message")
        .expect("read failed")
}

/// Reads messages until one with exactly `text` arrives; returns everything
/// seen, sentinel included. Keeps the tests tolerant of notice interleaving.
async fn recv_until(conn: &ClientConnection, text: &str) -> Vec<Message> {
    let mut seen = Vec::new();
    loop {
        let message = recv(conn).await;
        let done = message.text == text;
        seen.push(message);
        if done {
            return seen;
        }
    }
}

/// Drains the two messages every fresh client gets: its own connect notice,
/// then the private welcome.
async fn drain_greeting(conn: &ClientConnection) {
    let notice = recv(conn).await;
    assert_eq!(notice.sender, SYSTEM_SENDER);
    assert!(notice.text.ends_with(" connected"), "got {notice:?}");
    let welcome = recv(conn).await;
    assert_eq!(welcome, Message::system(WELCOME));
}

#[tokio::test]
async fn test_broadcast_reaches_all_clients_including_sender() {
    let server = start_server(unsupported_commands_strategy()).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;

    a.send_message(&Message::new("alice", "hi")).await.unwrap();
    let echoed = recv(&a).await;
    assert_eq!(echoed, Message::new("alice", "hi"));
}

#[tokio::test]
async fn test_new_client_gets_welcome_privately_not_prior_traffic() {
    let server = start_server(unsupported_commands_strategy()).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;
    a.send_message(&Message::new("alice", "hi")).await.unwrap();
    assert_eq!(recv(&a).await.text, "hi");

    // B joins after the fact; its greeting is its own connect notice plus the
    // welcome, and nothing of A's earlier traffic.
    let b = connect(&server).await;
    drain_greeting(&b).await;

    // A sees B's connect notice but never a second welcome.
    a.send_message(&Message::new("alice", "sync")).await.unwrap();
    let a_seen = recv_until(&a, "sync").await;
    assert!(
        a_seen.iter().any(|m| m.text.ends_with(" connected")),
        "A should see B's connect notice, got {a_seen:?}"
    );
    assert!(
        a_seen.iter().all(|m| m.text != WELCOME),
        "the welcome must stay private to B, got {a_seen:?}"
    );

    // B's first message after its greeting is the sync broadcast, not "hi".
    let b_seen = recv_until(&b, "sync").await;
    assert!(
        b_seen.iter().all(|m| m.text != "hi"),
        "B must not receive traffic from before it connected, got {b_seen:?}"
    );
}

#[tokio::test]
async fn test_slash_message_yields_private_unsupported_reply() {
    let server = start_server(unsupported_commands_strategy()).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;
    let b = connect(&server).await;
    drain_greeting(&b).await;
    // A drains B's connect notice so later reads line up.
    let notice = recv(&a).await;
    assert!(notice.text.ends_with(" connected"));

    a.send_message(&Message::new("alice", "/time")).await.unwrap();
    let reply = recv(&a).await;
    assert_eq!(reply, Message::system("Commands are not supported yet"));

    // No broadcast happened: B's next message is the follow-up chat line.
    a.send_message(&Message::new("alice", "after")).await.unwrap();
    assert_eq!(recv(&b).await.text, "after");
    assert_eq!(recv(&a).await.text, "after");
}

#[tokio::test]
async fn test_leading_whitespace_before_slash_still_routes_as_command() {
    let server = start_server(unsupported_commands_strategy()).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;

    a.send_message(&Message::new("alice", "   /cmd")).await.unwrap();
    let reply = recv(&a).await;
    assert_eq!(reply.text, "Commands are not supported yet");
}

#[tokio::test]
async fn test_one_broken_client_does_not_block_broadcast() {
    let server = start_server(unsupported_commands_strategy()).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;
    let b = connect(&server).await;
    drain_greeting(&b).await;
    let c = connect(&server).await;
    drain_greeting(&c).await;

    // Settle: everyone reads until a sentinel so the later asserts are clean.
    a.send_message(&Message::new("alice", "sync")).await.unwrap();
    recv_until(&a, "sync").await;
    recv_until(&b, "sync").await;
    recv_until(&c, "sync").await;

    // C goes away abruptly; the registry may still contain it when the next
    // broadcast snapshots, and that send will fail.
    c.disconnect().await;

    a.send_message(&Message::new("alice", "hello")).await.unwrap();
    let a_seen = recv_until(&a, "hello").await;
    let b_seen = recv_until(&b, "hello").await;
    assert_eq!(a_seen.last().unwrap().sender, "alice");
    assert_eq!(b_seen.last().unwrap().sender, "alice");
}

#[tokio::test]
async fn test_stalled_client_does_not_block_delivery_to_others() {
    // One worker: if a broadcast handler waited out a wedged recipient's
    // socket, nothing else would be delivered for the whole stall.
    let server = start_server_with_workers(unsupported_commands_strategy(), 1).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;

    // This client never reads. Its socket buffers fill under the large
    // broadcast below and its sends stall indefinitely.
    let _stalled = connect(&server).await;
    let notice = recv(&a).await;
    assert!(notice.text.ends_with(" connected"), "got {notice:?}");

    let big = "x".repeat(8 * 1024 * 1024);
    a.send_message(&Message::new("alice", big.as_str())).await.unwrap();
    a.send_message(&Message::new("alice", "ping")).await.unwrap();

    // Both broadcasts still reach A promptly, in order.
    let seen = recv_until(&a, "ping").await;
    assert!(
        seen.iter().any(|m| m.text == big),
        "the large broadcast must reach reading clients"
    );
}

#[tokio::test]
async fn test_finished_connection_tasks_are_reaped() {
    let server = start_server(unsupported_commands_strategy()).await;

    for _ in 0..8 {
        let c = connect(&server).await;
        drain_greeting(&c).await;
        c.disconnect().await;
    }
    // Let the server observe the disconnects and finish those loops.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Accepting the next connection reaps every task that already finished,
    // leaving only the new connection's read and outbound loops.
    let a = connect(&server).await;
    drain_greeting(&a).await;
    let tracked = server.manager.task_count();
    assert!(tracked <= 2, "finished tasks must not accumulate, have {tracked}");
}

#[tokio::test]
async fn test_exactly_one_connect_and_disconnect_notice() {
    let server = start_server(unsupported_commands_strategy()).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;

    let b = connect(&server).await;
    drain_greeting(&b).await;
    b.disconnect().await;

    // Give the server time to observe the EOF and fire the notice.
    tokio::time::sleep(Duration::from_millis(500)).await;

    a.send_message(&Message::new("alice", "done")).await.unwrap();
    let seen = recv_until(&a, "done").await;

    let connected = seen.iter().filter(|m| m.text.ends_with(" connected")).count();
    let disconnected = seen.iter().filter(|m| m.text.ends_with(" disconnected")).count();
    assert_eq!(connected, 1, "got {seen:?}");
    assert_eq!(disconnected, 1, "got {seen:?}");
}

#[tokio::test]
async fn test_disconnect_notice_uses_last_username() {
    let server = start_server(unsupported_commands_strategy()).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;
    let b = connect(&server).await;
    drain_greeting(&b).await;

    // A's sender name becomes its display name once a message is seen.
    a.send_message(&Message::new("alice", "sync")).await.unwrap();
    recv_until(&a, "sync").await;
    recv_until(&b, "sync").await;

    a.disconnect().await;

    let notice = recv(&b).await;
    assert_eq!(notice.sender, SYSTEM_SENDER);
    assert!(
        notice.text.starts_with("'alice'@") && notice.text.ends_with(" disconnected"),
        "got {notice:?}"
    );
}

#[tokio::test]
async fn test_gateway_strategy_replies_with_command_output() {
    let gateway = Arc::new(CommandGateway::new("/bin/sh", "-c {0}"));
    let strategy = gateway_strategy(gateway, Duration::from_secs(5));
    let server = start_server(strategy).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;

    a.send_message(&Message::new("alice", "/echo hi")).await.unwrap();
    let reply = recv(&a).await;
    assert_eq!(reply.sender, SYSTEM_SENDER);
    assert_eq!(reply.text, "hi\n");
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let server = start_server(unsupported_commands_strategy()).await;

    let a = connect(&server).await;
    drain_greeting(&a).await;

    let _ = server.shutdown_tx.send(());

    // The server tears the connection down; the client observes EOF.
    let result = timeout(Duration::from_secs(5), a.read_message())
        .await
        .expect("shutdown never reached the client");
    assert!(result.is_err());
}
