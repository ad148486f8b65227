use anyhow::Result;
use ferry_codec::{
    Error,
    frame::{self, FrameHeader, FrameKind, HEADER_LEN, Hello, WindowGetReq, WindowPutHead},
    rma::{ACCESS_READ_ONLY, CONTROL_RECORD_LEN, ControlRecord, MEM_HANDLE_LEN, MemHandleImage, RmaOp},
};

#[test]
fn test_frame_header() -> Result<()> {
    let header = FrameHeader {
        kind: FrameKind::Message,
        channel: 1,
        tag: 0x80,
        len: 21,
    };

    let bytes = header.encode();
    assert_eq!(bytes.len(), HEADER_LEN);
    assert_eq!(FrameHeader::decode(&bytes)?, header);

    // An unknown frame kind must be rejected, not mapped onto a known
    // one.
    let mut bad = bytes;
    bad[0] = 0x7f;
    assert!(matches!(FrameHeader::decode(&bad), Err(Error::UnknownKind)));

    // Truncated headers are detected before any field is read.
    assert!(matches!(
        FrameHeader::decode(&bytes[..4]),
        Err(Error::BufferTooSmall)
    ));

    Ok(())
}

#[test]
fn test_frame_build() -> Result<()> {
    let frame = frame::build(FrameKind::Message, 0, 7, &[b"hel", b"lo"]);

    let header = FrameHeader::decode(&frame)?;
    assert_eq!(header.kind, FrameKind::Message);
    assert_eq!(header.channel, 0);
    assert_eq!(header.tag, 7);
    assert_eq!(header.len, 5);
    assert_eq!(&frame[HEADER_LEN..], b"hello");

    Ok(())
}

#[test]
fn test_hello() -> Result<()> {
    let hello = Hello {
        revision: 3,
        rma: 0,
    };

    assert_eq!(Hello::decode(&hello.encode())?, hello);
    Ok(())
}

#[test]
fn test_control_record() -> Result<()> {
    let record = ControlRecord {
        op: RmaOp::Get,
        region: 42,
        disp: 128,
        count: 4096,
    };

    let bytes = record.encode();
    assert_eq!(bytes.len(), CONTROL_RECORD_LEN);
    assert_eq!(ControlRecord::decode(&bytes)?, record);

    let end = ControlRecord::end();
    assert_eq!(end.op, RmaOp::End);
    assert_eq!(end.region, 0);
    assert_eq!(end.disp, 0);
    assert_eq!(end.count, 0);

    let mut bad = bytes;
    bad[0] = 9;
    assert!(matches!(ControlRecord::decode(&bad), Err(Error::UnknownOp)));

    Ok(())
}

#[test]
fn test_mem_handle_image() -> Result<()> {
    let image = MemHandleImage {
        region: 7,
        len: 1 << 20,
        access: ACCESS_READ_ONLY,
    };

    let mut bytes = [0u8; MEM_HANDLE_LEN];
    image.write_to(&mut bytes)?;
    assert_eq!(MemHandleImage::read_from(&bytes)?, image);

    // A short destination leaves the destination untouched.
    let mut short = [0xffu8; MEM_HANDLE_LEN - 1];
    assert!(matches!(
        image.write_to(&mut short),
        Err(Error::BufferTooSmall)
    ));
    assert!(short.iter().all(|byte| *byte == 0xff));

    let mut bad = bytes;
    bad[16] = 3;
    assert!(matches!(
        MemHandleImage::read_from(&bad),
        Err(Error::UnknownAccess)
    ));

    Ok(())
}

#[test]
fn test_window_bodies() -> Result<()> {
    let put = WindowPutHead {
        region: 3,
        offset: 512,
    };
    assert_eq!(WindowPutHead::decode(&put.encode())?, put);

    let get = WindowGetReq {
        region: 3,
        offset: 512,
        count: 64,
        seq: 9,
    };
    assert_eq!(WindowGetReq::decode(&get.encode())?, get);

    Ok(())
}
