mod common;

use std::sync::Arc;
use std::time::Duration;

use common::simulated_manager;
use serialmon_lib::{BaudRate, CloseReason, PortIdentifier, SerialError, SessionState};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn opens_at_every_supported_baud_rate() {
    let (backend, manager) = simulated_manager();

    for baud in BaudRate::ALL {
        let name = format!("/dev/ttySIM{}", baud.as_u32());
        let device = backend.add_device(&name);

        let session = manager.open(&PortIdentifier::new(&name), baud).await.unwrap();
        assert_eq!(session.baud_rate(), baud);
        assert_eq!(device.baud_rate(), Some(baud));
        assert!(session.is_open());

        manager.close(&session).await;
    }
}

#[tokio::test]
async fn second_open_on_same_port_is_rejected() {
    let (backend, manager) = simulated_manager();
    let device = backend.add_device("/dev/ttyACM0");
    let port = PortIdentifier::new("/dev/ttyACM0");

    let first = manager.open(&port, BaudRate::B9600).await.unwrap();
    let second = manager.open(&port, BaudRate::B115200).await;

    assert!(matches!(second, Err(SerialError::AlreadyOpen(p)) if p == port));
    assert!(first.is_open());
    assert_eq!(manager.sessions().len(), 1);
    assert_eq!(manager.session(&port).unwrap().id(), first.id());
    assert_eq!(device.open_count(), 1);
}

#[tokio::test]
async fn racing_opens_produce_exactly_one_session() {
    let (backend, manager) = simulated_manager();
    backend.add_device("/dev/ttyUSB0");
    let port = PortIdentifier::new("/dev/ttyUSB0");

    let (a, b) = tokio::join!(
        manager.open(&port, BaudRate::B57600),
        manager.open(&port, BaudRate::B57600)
    );

    let opened = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(opened, 1);
    let rejected = [a, b].into_iter().find_map(Result::err).unwrap();
    assert!(matches!(rejected, SerialError::AlreadyOpen(_)));
    assert_eq!(manager.sessions().len(), 1);
}

#[tokio::test]
async fn missing_device_is_not_found() {
    let (_backend, manager) = simulated_manager();
    let port = PortIdentifier::new("/dev/ttyNOPE");

    let result = manager.open(&port, BaudRate::B9600).await;
    assert!(matches!(result, Err(SerialError::DeviceNotFound(p)) if p == port));
    assert!(!manager.is_open(&port));
}

#[tokio::test]
async fn busy_device_fails_to_open_and_leaves_port_free() {
    let (backend, manager) = simulated_manager();
    let device = backend.add_device("COM3");
    let port = PortIdentifier::new("COM3");

    device.set_busy(Some("Access is denied."));
    match manager.open(&port, BaudRate::B19200).await {
        Err(SerialError::OpenFailed { port: p, message }) => {
            assert_eq!(p, port);
            assert_eq!(message, "Access is denied.");
        }
        other => panic!("expected OpenFailed, got {:?}", other),
    }

    // The failed attempt must not hold the port
    device.set_busy(None);
    let session = manager.open(&port, BaudRate::B19200).await.unwrap();
    assert!(session.is_open());
}

#[tokio::test]
async fn close_is_idempotent_and_frees_the_port() {
    let (backend, manager) = simulated_manager();
    let device = backend.add_device("/dev/ttyS1");
    let port = PortIdentifier::new("/dev/ttyS1");

    let session = manager.open(&port, BaudRate::B38400).await.unwrap();
    manager.close(&session).await;
    manager.close(&session).await;

    assert_eq!(session.state(), SessionState::Closed(CloseReason::Requested));
    assert!(!manager.is_open(&port));
    assert!(manager.sessions().is_empty());

    let reopened = manager.open(&port, BaudRate::B4800).await.unwrap();
    assert_ne!(reopened.id(), session.id());
    assert_eq!(device.open_count(), 2);
}

#[tokio::test]
async fn transfers_on_closed_session_fail() {
    let (backend, manager) = simulated_manager();
    backend.add_device("/dev/ttyS2");
    let port = PortIdentifier::new("/dev/ttyS2");

    let session = manager.open(&port, BaudRate::B9600).await.unwrap();
    manager.close(&session).await;

    assert!(matches!(session.write(b"ping").await, Err(SerialError::SessionClosed(_))));
    assert!(matches!(
        session.read(8, Duration::from_millis(10)).await,
        Err(SerialError::SessionClosed(_))
    ));
}

#[tokio::test]
async fn closing_releases_the_device_link() {
    let (backend, manager) = simulated_manager();
    let device = backend.add_device("/dev/ttyS3");
    let port = PortIdentifier::new("/dev/ttyS3");

    let session = manager.open(&port, BaudRate::B9600).await.unwrap();
    let mut peer = device.accept().await;
    manager.close(&session).await;

    // Host end is gone once close returns, so the device sees end of stream
    let mut buf = [0u8; 1];
    let n = tokio::io::AsyncReadExt::read(&mut peer, &mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn close_all_closes_every_session() {
    let (backend, manager) = simulated_manager();
    backend.add_device("/dev/ttyA");
    backend.add_device("/dev/ttyB");

    let a = manager.open(&PortIdentifier::new("/dev/ttyA"), BaudRate::B9600).await.unwrap();
    let b = manager.open(&PortIdentifier::new("/dev/ttyB"), BaudRate::B9600).await.unwrap();
    let ports: Vec<String> = manager.sessions().into_iter().map(|info| info.port.to_string()).collect();
    assert_eq!(ports, vec!["/dev/ttyA", "/dev/ttyB"]);

    manager.close_all().await;
    assert!(!a.is_open());
    assert!(!b.is_open());
    assert!(manager.sessions().is_empty());
}

#[tokio::test]
async fn closed_resolves_with_reason() {
    let (backend, manager) = simulated_manager();
    backend.add_device("/dev/ttyS4");
    let session = manager
        .open(&PortIdentifier::new("/dev/ttyS4"), BaudRate::B115200)
        .await
        .unwrap();

    let watcher = session.clone();
    let waiting = tokio::spawn(async move { watcher.closed().await });
    manager.close(&session).await;

    assert_eq!(waiting.await.unwrap(), CloseReason::Requested);
}

#[tokio::test]
async fn port_stays_claimed_until_close_releases_the_device() {
    let (backend, manager) = simulated_manager();
    let manager = Arc::new(manager);
    let device = backend.add_device("/dev/ttyS5");
    let port = PortIdentifier::new("/dev/ttyS5");

    let session = manager.open(&port, BaudRate::B9600).await.unwrap();
    let mut old_link = device.accept().await;

    let closing = {
        let manager = manager.clone();
        let session = session.clone();
        tokio::spawn(async move { manager.close(&session).await })
    };
    while session.is_open() {
        tokio::task::yield_now().await;
    }

    // Mid-close the port is either still claimed, or the old link is already gone
    let reopened = match manager.open(&port, BaudRate::B9600).await {
        Ok(reopened) => {
            assert!(old_link.write(b"x").await.is_err(), "old link alive after reopen");
            Some(reopened)
        }
        Err(SerialError::AlreadyOpen(_)) => None,
        Err(other) => panic!("unexpected open error: {:?}", other),
    };

    closing.await.unwrap();
    assert!(old_link.write(b"x").await.is_err());
    if reopened.is_none() {
        assert!(manager.open(&port, BaudRate::B9600).await.unwrap().is_open());
    }
    assert_eq!(device.open_count(), 2);
}

#[tokio::test]
async fn every_concurrent_close_waits_for_the_device_release() {
    let (backend, manager) = simulated_manager();
    let manager = Arc::new(manager);
    let device = backend.add_device("/dev/ttyS6");

    let session = manager
        .open(&PortIdentifier::new("/dev/ttyS6"), BaudRate::B9600)
        .await
        .unwrap();
    let mut link = device.accept().await;

    let first = {
        let manager = manager.clone();
        let session = session.clone();
        tokio::spawn(async move { manager.close(&session).await })
    };
    while session.is_open() {
        tokio::task::yield_now().await;
    }

    manager.close(&session).await;
    assert!(link.write(b"x").await.is_err(), "second close returned before the device was released");
    first.await.unwrap();
}

#[tokio::test]
async fn reopen_hands_out_the_live_link() {
    let (backend, manager) = simulated_manager();
    let device = backend.add_device("/dev/ttyS7");
    let port = PortIdentifier::new("/dev/ttyS7");

    // First link is never accepted
    let first = manager.open(&port, BaudRate::B9600).await.unwrap();
    manager.close(&first).await;

    let second = manager.open(&port, BaudRate::B9600).await.unwrap();
    let mut link = device.accept().await;
    link.write_all(b"fresh").await.unwrap();

    assert_eq!(second.read(16, Duration::from_millis(100)).await.unwrap(), b"fresh");
}
