//! Buffer-credit behaviour: slow consumers, stalled streams, and bounded
//! waits for outbound slots.

use std::time::{Duration, Instant};

use weft_mux::{Config, Error, Session};

fn pair_with(config: Config) -> (Session, Session) {
    let (left, right) = tokio::io::duplex(256 * 1024);
    let a = Session::with_config(left, true, None, config.clone()).unwrap();
    let b = Session::with_config(right, false, None, config).unwrap();
    (a, b)
}

fn quick_reset_config() -> Config {
    let mut config = Config::default();
    config.receive_timeout = Duration::from_millis(200);
    config
}

#[tokio::test]
async fn slow_consumer_stream_is_reset() {
    let (a, b) = pair_with(quick_reset_config());

    let out = a.open_stream().await.unwrap();
    let stalled = b.accept_stream().await.unwrap();

    // Four one-byte messages pin the peer's whole buffer budget; the
    // fifth stalls its receive loop and draws the reset.
    for _ in 0..5 {
        out.write(&[1]).await.unwrap();
    }

    let give_up = Instant::now() + Duration::from_secs(5);
    let err = loop {
        match out.write(&[1]).await {
            Err(err) => break err,
            Ok(_) => {
                assert!(Instant::now() < give_up, "reset never arrived");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    };
    assert!(matches!(err, Error::StreamReset));

    let mut buf = [0u8; 4];
    assert!(matches!(
        stalled.read(&mut buf).await,
        Err(Error::StreamReset)
    ));

    // Neither session went down over it.
    assert!(a.close_reason().is_none());
    assert!(b.close_reason().is_none());
}

#[tokio::test]
async fn stalled_stream_does_not_starve_well_behaved_streams() {
    let (a, b) = pair_with(quick_reset_config());

    let hog_out = a.open_named_stream("hog").await.unwrap();
    let good_out = a.open_named_stream("good").await.unwrap();
    let hog_in = b.accept_stream().await.unwrap();
    assert_eq!(hog_in.name(), "hog");
    let good_in = b.accept_stream().await.unwrap();
    assert_eq!(good_in.name(), "good");

    // Pin every inbound slot on the hog, whose consumer never reads.
    for _ in 0..4 {
        hog_out.write(&[0]).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The well-behaved stream's message must still get through: the
    // receive loop reclaims credit from the hog, not from this stream.
    good_out.write(b"through").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), good_in.read(&mut buf))
        .await
        .expect("well-behaved stream starved")
        .unwrap();
    assert_eq!(&buf[..n], b"through");

    assert!(matches!(
        hog_in.read(&mut buf).await,
        Err(Error::StreamReset)
    ));
}

#[tokio::test]
async fn write_deadline_bounds_a_blocked_write() {
    // A tiny transport buffer that nobody drains: the send loop jams and
    // outbound slots run out.
    let (left, right) = tokio::io::duplex(64);
    let a = Session::with_config(left, true, None, Config::default()).unwrap();
    let _parked_peer = right;

    let out = a.open_stream().await.unwrap();
    out.set_write_deadline(Some(Instant::now() + Duration::from_millis(100)));

    let start = Instant::now();
    let err = loop {
        match out.write(&[9u8; 1024]).await {
            Err(err) => break err,
            Ok(_) => {}
        }
    };
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn writes_fail_fast_after_session_close() {
    let (a, _b) = pair_with(Config::default());
    let out = a.open_stream().await.unwrap();
    a.close().await;

    let start = Instant::now();
    let err = out.write(b"x").await.unwrap_err();
    assert!(matches!(err, Error::StreamReset | Error::Shutdown));
    assert!(start.elapsed() < Duration::from_secs(1));

    let mut buf = [0u8; 4];
    let err = out.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::StreamReset | Error::Shutdown));
}
