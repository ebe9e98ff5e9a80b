use std::thread;
use std::time::Duration;

use anyhow::Result;
use mock::{Deployment, GUEST_VM, SERVER_VM};
use parking_lot::Mutex;
use transport::{IvcConfig, Mempool, PeerId};

const POOL_SIZE: usize = 64 * 1024;

fn deployment() -> Result<Deployment> {
    Deployment::new().queue_with_mempool(0, IvcConfig::new(2, 64), POOL_SIZE)
}

#[test]
fn server_sees_bulk_data_written_by_the_guest() -> Result<()> {
    let deployment = deployment()?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[64])?;
    assert!(deployment.guest_pools().is_reserved(0));

    let mut region = fw
        .oob_get_ptr(0, SERVER_VM, 0)?
        .expect("mempool shared with the server");
    assert_eq!(region.len(), POOL_SIZE);
    assert_eq!(region.peer(), SERVER_VM);
    region.write_at(POOL_SIZE - 9, b"bulk-data")?;
    fw.oob_put_ptr(region);

    let server_view = deployment.server_mempool(0)?.map()?;
    // SAFETY: the guest released the region; nothing writes it concurrently.
    let tail = unsafe {
        std::slice::from_raw_parts(server_view.as_ptr().add(POOL_SIZE - 9), 9)
    };
    assert_eq!(tail, b"bulk-data");

    fw.deinit(0, 0..1)?;
    assert!(!deployment.guest_pools().is_reserved(0));
    Ok(())
}

#[test]
fn requests_for_another_peer_get_nothing() -> Result<()> {
    let deployment = deployment()?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[64])?;
    assert!(fw.oob_get_ptr(0, GUEST_VM, 0)?.is_none());
    // The failed request must not leave the region locked.
    assert!(fw.oob_get_ptr(0, SERVER_VM, 0)?.is_some());
    Ok(())
}

#[test]
fn concurrent_holders_serialize() -> Result<()> {
    let deployment = deployment()?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[64])?;
    let log = Mutex::new(Vec::new());

    thread::scope(|scope| {
        scope.spawn(|| {
            let region = fw.oob_get_ptr(0, SERVER_VM, 0).expect("oob").expect("region");
            log.lock().push("first acquired");
            thread::sleep(Duration::from_millis(50));
            log.lock().push("first released");
            fw.oob_put_ptr(region);
        });
        scope.spawn(|| {
            while log.lock().is_empty() {
                thread::yield_now();
            }
            let region = fw.oob_get_ptr(0, SERVER_VM, 0).expect("oob").expect("region");
            log.lock().push("second acquired");
            fw.oob_put_ptr(region);
        });
    });

    assert_eq!(
        *log.lock(),
        vec!["first acquired", "first released", "second acquired"]
    );
    Ok(())
}

#[test]
fn framed_traffic_is_not_blocked_by_an_oob_holder() -> Result<()> {
    let deployment = deployment()?;
    let fw = deployment.framework()?;
    fw.init(0, 0..1, 1, &[64])?;

    let region = fw.oob_get_ptr(0, SERVER_VM, 0)?.expect("region");
    fw.send(0, PeerId::SELF, 0, b"framed")?;
    let message = fw.recv(0, 0)?;
    assert_eq!(&message[..6], b"framed");
    fw.oob_put_ptr(region);
    Ok(())
}
