use std::sync::Arc;
use std::time::Duration;

use avlink::{
    DeviceEngine, DeviceHandle, Framing, LinkError, Matcher, ProtocolBuilder, SerialSettings,
    Value,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A device with one poll (`P`), two commands (`1`, `2`) and a bare `OK` ack.
fn device(tick: Duration) -> (DeviceHandle, DuplexStream, JoinHandle<Result<(), LinkError>>) {
    let protocol = ProtocolBuilder::new("bench", Framing::Text)
        .ack(Matcher::Exact("OK".into()))
        .poll("status", b"P\r\n".to_vec(), 1.0)
        .expect("poll")
        .command("first", |_| Ok(b"1\r\n".to_vec()))
        .expect("command")
        .command("second", |_| Ok(b"2\r\n".to_vec()))
        .expect("command")
        .command_no_reply("reset", |_| Ok(b"R\r\n".to_vec()))
        .expect("command")
        .build()
        .expect("protocol");
    let (engine, handle) =
        DeviceEngine::new("bench", Arc::new(protocol), &SerialSettings::default())
            .expect("engine");
    let (link, peer) = tokio::io::duplex(256);
    let task = tokio::spawn(engine.with_tick_interval(tick).run(link));
    (handle, peer, task)
}

async fn next_line(peer: &mut DuplexStream) -> String {
    let mut buf = [0u8; 3];
    peer.read_exact(&mut buf).await.expect("read");
    String::from_utf8_lossy(&buf).into_owned()
}

fn spawn_command(handle: &DeviceHandle, key: &'static str) -> JoinHandle<Result<Value, LinkError>> {
    let h = handle.clone();
    tokio::spawn(async move { h.enqueue_command(key, Vec::new()).await })
}

#[tokio::test(start_paused = true)]
async fn timeout_rejects_then_next_poll_goes_out() {
    let (handle, mut peer, _engine) = device(Duration::from_secs(3600));
    let t0 = Instant::now();
    let cmd = spawn_command(&handle, "first");

    assert_eq!(next_line(&mut peer).await, "1\r\n");
    let err = cmd.await.expect("join").expect_err("no reply");
    assert!(matches!(err, LinkError::Timeout { .. }));
    let waited = t0.elapsed();
    assert!(waited >= Duration::from_millis(500) && waited < Duration::from_millis(600));

    assert_eq!(next_line(&mut peer).await, "P\r\n");
    assert!(t0.elapsed() >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn queued_commands_go_before_polls_in_order() {
    let (handle, mut peer, _engine) = device(Duration::from_millis(100));

    assert_eq!(next_line(&mut peer).await, "P\r\n");
    let first = spawn_command(&handle, "first");
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = spawn_command(&handle, "second");
    tokio::time::sleep(Duration::from_millis(10)).await;

    peer.write_all(b"OK\r\n").await.expect("write");
    assert_eq!(next_line(&mut peer).await, "1\r\n");
    peer.write_all(b"OK\r\n").await.expect("write");
    assert_eq!(next_line(&mut peer).await, "2\r\n");
    peer.write_all(b"OK\r\n").await.expect("write");

    assert_eq!(first.await.expect("join").expect("ok"), Value::Null);
    assert_eq!(second.await.expect("join").expect("ok"), Value::Null);
    assert_eq!(next_line(&mut peer).await, "P\r\n");
}

#[tokio::test(start_paused = true)]
async fn command_waits_behind_poll_sent_on_expiry() {
    let (handle, mut peer, _engine) = device(Duration::from_secs(3600));
    let first = spawn_command(&handle, "first");
    assert_eq!(next_line(&mut peer).await, "1\r\n");
    assert!(matches!(first.await.expect("join"), Err(LinkError::Timeout { .. })));

    // the poll sent on expiry is now outstanding; a second command waits behind it
    assert_eq!(next_line(&mut peer).await, "P\r\n");
    let second = spawn_command(&handle, "second");
    tokio::time::sleep(Duration::from_millis(10)).await;
    peer.write_all(b"OK\r\n").await.expect("write");
    assert_eq!(next_line(&mut peer).await, "2\r\n");
    peer.write_all(b"OK\r\n").await.expect("write");
    assert_eq!(second.await.expect("join").expect("ok"), Value::Null);
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_resolves_on_write() {
    let (handle, mut peer, _engine) = device(Duration::from_secs(3600));
    let reset = spawn_command(&handle, "reset");
    assert_eq!(next_line(&mut peer).await, "R\r\n");
    assert_eq!(reset.await.expect("join").expect("written"), Value::Null);

    // the link never waited for a reply, so the poll followed straight away
    assert_eq!(next_line(&mut peer).await, "P\r\n");
}
