use std::time::Duration;

use anyhow::Result;
use ferry_transport::{
    AccessMode, Address, Error, MEM_HANDLE_LEN, Node, NodeOptions, RmaMode, Role, Unexpected,
};
use tokio::time::sleep;

fn options(role: Role, rma: RmaMode) -> NodeOptions {
    NodeOptions {
        role,
        listen: None,
        port_file: None,
        rma,
    }
}

async fn pair(rma: RmaMode) -> Result<(Node, Node, Address)> {
    let server = Node::bind(options(Role::Server, rma)).await?;
    let client = Node::bind(options(Role::Client, rma)).await?;
    let address = client.addr_lookup(server.port_name()).await?;

    Ok((server, client, address))
}

async fn poll_unexpected(server: &Node, capacity: usize) -> Result<Unexpected> {
    for _ in 0..500 {
        if let Some(unexpected) = server.recv_unexpected(capacity)? {
            return Ok(unexpected);
        }

        sleep(Duration::from_millis(10)).await;
    }

    anyhow::bail!("no unexpected message arrived")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unexpected_message_roundtrip() -> Result<()> {
    let (server, client, address) = pair(RmaMode::Emulated).await?;

    let mut send = client.send_unexpected(b"hello", &address, 7)?;
    let status = client.wait(&mut send, 1000).await?;
    assert!(status.completed);
    assert_eq!(status.count, 0);

    let mut unexpected = poll_unexpected(&server, server.unexpected_size()).await?;
    assert_eq!(unexpected.count, 5);
    assert_eq!(unexpected.tag, 7);
    assert_eq!(unexpected.source.rank(), 0);
    assert!(unexpected.source.is_reference());

    let status = server.wait(&mut unexpected.request, 1000).await?;
    assert!(status.completed);
    assert_eq!(status.count, 5);
    assert_eq!(status.data.as_deref(), Some(b"hello".as_slice()));

    server.finalize().await?;
    client.addr_free(&address).await?;
    client.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unexpected_respects_capacity() -> Result<()> {
    let (server, client, address) = pair(RmaMode::Emulated).await?;

    assert_eq!(server.unexpected_size(), 4096);

    let payload = vec![0x5au8; 64];
    let mut send = client.send_unexpected(&payload, &address, 3)?;
    client.wait(&mut send, 1000).await?;

    // An oversized probe fails without consuming the message.
    let mut rejected = false;
    for _ in 0..500 {
        match server.recv_unexpected(16) {
            Err(Error::BufferTooSmall) => {
                rejected = true;
                break;
            }
            Ok(None) => sleep(Duration::from_millis(10)).await,
            Ok(Some(_)) => anyhow::bail!("oversized message was consumed"),
            Err(e) => return Err(e.into()),
        }
    }
    assert!(rejected);

    // The message is still there for a large enough receive.
    let mut unexpected = poll_unexpected(&server, 4096).await?;
    let status = server.wait(&mut unexpected.request, 1000).await?;
    assert_eq!(status.data.as_deref(), Some(payload.as_slice()));

    server.finalize().await?;
    client.addr_free(&address).await?;
    client.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_zero_probes_without_consuming() -> Result<()> {
    let (server, client, address) = pair(RmaMode::Emulated).await?;

    // The server learns the client address from a first message.
    let mut send = client.send_unexpected(b"hi", &address, 1)?;
    client.wait(&mut send, 1000).await?;
    let mut unexpected = poll_unexpected(&server, 4096).await?;
    server.wait(&mut unexpected.request, 1000).await?;

    // A receive with no matching send stays pending under a zero
    // timeout and the request survives.
    let mut recv = client.recv(&address, 9)?;
    let status = client.wait(&mut recv, 0).await?;
    assert!(!status.completed);

    let mut reply = server.send(b"pong", &unexpected.source, 9)?;
    server.wait(&mut reply, 1000).await?;

    let status = client.wait(&mut recv, 5000).await?;
    assert!(status.completed);
    assert_eq!(status.count, 4);
    assert_eq!(status.data.as_deref(), Some(b"pong".as_slice()));

    // A consumed request must not be waitable again.
    assert!(matches!(
        client.wait(&mut recv, 1000).await,
        Err(Error::DoubleFree)
    ));

    server.finalize().await?;
    client.addr_free(&address).await?;
    client.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emulated_put_delivers_and_acknowledges() -> Result<()> {
    let (server, client, address) = pair(RmaMode::Emulated).await?;

    let exposed = client.mem_register(1024, AccessMode::ReadWrite)?;
    let mut image = [0u8; MEM_HANDLE_LEN];
    client.mem_handle_serialize(&mut image, &exposed)?;

    let mut send = client.send_unexpected(&image, &address, 1)?;
    client.wait(&mut send, 1000).await?;

    let mut unexpected = poll_unexpected(&server, 4096).await?;
    let status = server.wait(&mut unexpected.request, 1000).await?;
    let remote = server.mem_handle_deserialize(status.data.as_deref().unwrap_or_default())?;

    let pattern: Vec<u8> = (0..1024).map(|_| rand::random::<u8>()).collect();
    let source = server.mem_register(1024, AccessMode::ReadOnly)?;
    source.write_at(0, &pattern)?;

    // The wait covers both the payload and the acknowledgement.
    let mut put = server.put(&source, 0, &remote, 0, 1024, &unexpected.source)?;
    let status = server.wait(&mut put, 5000).await?;
    assert!(status.completed);

    // The acknowledgement already fenced the transfer; the region is
    // in its final state.
    assert_eq!(exposed.read_at(0, 1024)?.as_ref(), pattern.as_slice());

    server.mem_handle_free(remote)?;
    server.mem_deregister(&source)?;
    client.mem_deregister(&exposed)?;
    server.finalize().await?;
    client.addr_free(&address).await?;
    client.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_against_read_only_is_rejected() -> Result<()> {
    let (server, client, address) = pair(RmaMode::Emulated).await?;

    let pattern: Vec<u8> = (0..512).map(|_| rand::random::<u8>()).collect();
    let exposed = client.mem_register(512, AccessMode::ReadOnly)?;
    exposed.write_at(0, &pattern)?;

    let mut image = [0u8; MEM_HANDLE_LEN];
    client.mem_handle_serialize(&mut image, &exposed)?;
    let mut send = client.send_unexpected(&image, &address, 1)?;
    client.wait(&mut send, 1000).await?;

    let mut unexpected = poll_unexpected(&server, 4096).await?;
    let status = server.wait(&mut unexpected.request, 1000).await?;
    let remote = server.mem_handle_deserialize(status.data.as_deref().unwrap_or_default())?;

    let junk = server.mem_register(512, AccessMode::ReadOnly)?;
    junk.write_at(0, &[0xffu8; 512])?;

    // Rejected locally, before any control record goes out.
    assert!(matches!(
        server.put(&junk, 0, &remote, 0, 512, &unexpected.source),
        Err(Error::Permission)
    ));

    // The side channel stayed clean: a get still works and sees the
    // region untouched.
    let probe = server.mem_register(512, AccessMode::ReadWrite)?;
    let mut get = server.get(&probe, 0, &remote, 0, 512, &unexpected.source)?;
    let status = server.wait(&mut get, 5000).await?;
    assert!(status.completed);
    assert_eq!(probe.read_at(0, 512)?.as_ref(), pattern.as_slice());

    server.finalize().await?;
    client.addr_free(&address).await?;
    client.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bulk_get_roundtrip() -> Result<()> {
    const COUNT: usize = 1_048_576;
    const BYTES: usize = COUNT * 4;

    let (server, client, address) = pair(RmaMode::Emulated).await?;

    let mut values = Vec::with_capacity(BYTES);
    for value in 0..COUNT as i32 {
        values.extend_from_slice(&value.to_le_bytes());
    }

    let exposed = client.mem_register(BYTES, AccessMode::ReadOnly)?;
    exposed.write_at(0, &values)?;

    // A small call payload carries the handle image plus a file
    // descriptor number.
    let mut payload = vec![0u8; MEM_HANDLE_LEN + 4];
    client.mem_handle_serialize(&mut payload[..MEM_HANDLE_LEN], &exposed)?;
    payload[MEM_HANDLE_LEN..].copy_from_slice(&12345i32.to_le_bytes());

    let mut send = client.send_unexpected(&payload, &address, 2)?;
    client.wait(&mut send, 1000).await?;

    let mut unexpected = poll_unexpected(&server, 4096).await?;
    let status = server.wait(&mut unexpected.request, 1000).await?;
    let data = status.data.unwrap_or_default();
    let remote = server.mem_handle_deserialize(&data[..MEM_HANDLE_LEN])?;
    let descriptor = i32::from_le_bytes(data[MEM_HANDLE_LEN..].try_into()?);
    assert_eq!(descriptor, 12345);
    assert_eq!(remote.len(), BYTES as u64);

    let sink = server.mem_register(BYTES, AccessMode::ReadWrite)?;
    let mut get = server.get(&sink, 0, &remote, 0, BYTES, &unexpected.source)?;
    let status = server.wait(&mut get, 30000).await?;
    assert!(status.completed);
    assert_eq!(status.count, BYTES);

    let pulled = sink.read_at(0, BYTES)?;
    assert_eq!(pulled.as_ref(), values.as_slice());

    // The server reports the byte count back in-band.
    let mut reply = server.send(&(BYTES as i32).to_le_bytes(), &unexpected.source, 3)?;
    server.wait(&mut reply, 1000).await?;

    let mut recv = client.recv(&address, 3)?;
    let status = client.wait(&mut recv, 5000).await?;
    let reported = i32::from_le_bytes(status.data.unwrap_or_default().as_ref().try_into()?);
    assert_eq!(reported, BYTES as i32);

    server.finalize().await?;
    client.addr_free(&address).await?;
    client.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finalize_terminates_remote_services() -> Result<()> {
    let server = Node::bind(options(Role::Server, RmaMode::Emulated)).await?;

    let first = Node::bind(options(Role::Client, RmaMode::Emulated)).await?;
    let first_address = first.addr_lookup(server.port_name()).await?;

    let second = Node::bind(options(Role::Client, RmaMode::Emulated)).await?;
    let second_address = second.addr_lookup(server.port_name()).await?;

    server.finalize().await?;

    // Both services received an end record and their joins come back
    // promptly.
    tokio::time::timeout(Duration::from_secs(5), first.addr_free(&first_address)).await??;
    tokio::time::timeout(Duration::from_secs(5), second.addr_free(&second_address)).await??;

    first.finalize().await?;
    second.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn addr_free_twice_is_reported() -> Result<()> {
    let (server, client, address) = pair(RmaMode::Emulated).await?;

    client.addr_free(&address).await?;
    assert!(matches!(
        client.addr_free(&address).await,
        Err(Error::DoubleFree)
    ));

    server.finalize().await?;
    client.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mem_handle_image_survives_roundtrip() -> Result<()> {
    // No traffic involved; a bare client node is enough.
    let node = Node::bind(options(Role::Client, RmaMode::Emulated)).await?;

    let handle = node.mem_register(4096, AccessMode::ReadWrite)?;
    let mut image = [0u8; MEM_HANDLE_LEN];
    node.mem_handle_serialize(&mut image, &handle)?;

    let copy = node.mem_handle_deserialize(&image)?;
    assert_eq!(copy.len(), handle.len());
    assert_eq!(copy.access(), handle.access());

    let mut reimage = [0u8; MEM_HANDLE_LEN];
    node.mem_handle_serialize(&mut reimage, &copy)?;
    assert_eq!(image, reimage);

    // Serialization into a short buffer has no side effects.
    let mut short = [0u8; MEM_HANDLE_LEN - 1];
    assert!(matches!(
        node.mem_handle_serialize(&mut short, &handle),
        Err(Error::BufferTooSmall)
    ));

    node.mem_handle_free(copy)?;
    node.mem_deregister(&handle)?;
    assert!(matches!(
        node.mem_deregister(&handle),
        Err(Error::DoubleFree)
    ));

    node.finalize().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn port_name_is_published_padded() -> Result<()> {
    use ferry_transport::{PORT_NAME_LEN, read_port_name};

    let path = std::env::temp_dir().join(format!(
        "ferry-port-{}-{}.cfg",
        std::process::id(),
        rand::random::<u64>()
    ));

    let server = Node::bind(NodeOptions {
        role: Role::Server,
        listen: None,
        port_file: Some(path.clone()),
        rma: RmaMode::Emulated,
    })
    .await?;

    let raw = std::fs::read(&path)?;
    assert_eq!(raw.len(), PORT_NAME_LEN);

    // The padded name from the file resolves exactly like the
    // unpadded one.
    let name = read_port_name(&path)?;
    assert_eq!(name.trim_end_matches('\0'), server.port_name());

    let client = Node::bind(options(Role::Client, RmaMode::Emulated)).await?;
    let address = client.addr_lookup(&name).await?;

    client.addr_free(&address).await?;
    server.finalize().await?;
    client.finalize().await?;

    std::fs::remove_file(&path)?;

    Ok(())
}
