//! Two frontend connections sharing one device and its scanout engines.

mod harness;

use pretty_assertions::assert_eq;
use pvdisplay_backend::{
    DisplayDevice, DisplayMode, DisplbackConfig, OutputState, SoftwareBackendConfig,
    SoftwareConnector,
};
use pvdisplay_protocol::displif::{
    DbufCreateReq, DbufDestroyReq, DisplCommand, DisplEvent, DisplEventKind, FbAttachReq,
    FbDetachReq, PgFlipReq, SetConfigReq,
};
use pvdisplay_protocol::format::FOURCC_XRGB8888;
use pvdisplay_protocol::status::{EBUSY, ENODEV, ENOENT, ESHUTDOWN};

use harness::{init_tracing, software_backend, Connection, Guest, SharedBuffer};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 64;
const SIZE: usize = (WIDTH * HEIGHT * 4) as usize;

fn connector(id: u32, current_engine: Option<u32>) -> SoftwareConnector {
    SoftwareConnector {
        id,
        connected: true,
        modes: vec![DisplayMode::new(WIDTH, HEIGHT)],
        current_engine,
        possible_engines: vec![20, 21],
    }
}

fn create(db_cookie: u64, buffer: &SharedBuffer) -> DisplCommand {
    DisplCommand::DbufCreate(DbufCreateReq {
        dbuf_cookie: db_cookie,
        width: WIDTH,
        height: HEIGHT,
        bpp: 32,
        buffer_sz: SIZE as u32,
        flags: 0,
        gref_directory: buffer.directory_start,
    })
}

fn attach(db_cookie: u64, fb_cookie: u64) -> DisplCommand {
    DisplCommand::FbAttach(FbAttachReq {
        dbuf_cookie: db_cookie,
        fb_cookie,
        width: WIDTH,
        height: HEIGHT,
        pixel_format: FOURCC_XRGB8888,
    })
}

fn set_config(fb_cookie: u64) -> DisplCommand {
    DisplCommand::SetConfig(SetConfigReq {
        fb_cookie,
        x: 0,
        y: 0,
        width: WIDTH,
        height: HEIGHT,
        bpp: 32,
    })
}

fn flip(fb_cookie: u64) -> DisplCommand {
    DisplCommand::PgFlip(PgFlipReq { fb_cookie })
}

#[test]
fn independent_outputs_flip_on_their_own_engines() {
    init_tracing();
    let mut guest = Guest::new();
    let backend = software_backend(
        &guest,
        SoftwareBackendConfig {
            connectors: vec![connector(0, Some(21)), connector(1, None)],
            ..Default::default()
        },
    );
    let console = backend.engine_config(21).unwrap();
    let device = DisplayDevice::start(backend.clone(), DisplbackConfig::default()).unwrap();
    let mut left = Connection::open(&device, &guest, 0);
    let mut right = Connection::open(&device, &guest, 1);

    // Four data pages per buffer; cookies only need to be unique per connection.
    let left_buf = guest.share_buffer(SIZE, 0xaa);
    let right_buf = guest.share_buffer(SIZE, 0xbb);
    assert_eq!(left_buf.data.len(), 4);
    assert_eq!(left.status(create(1, &left_buf)), 0);
    assert_eq!(right.status(create(1, &right_buf)), 0);
    assert_eq!(left.status(attach(1, 10)), 0);
    assert_eq!(right.status(attach(1, 10)), 0);

    assert_eq!(left.status(set_config(10)), 0);
    assert_eq!(right.status(set_config(10)), 0);
    assert_eq!(left.dispatcher.output().engine(), Some(21));
    assert_eq!(right.dispatcher.output().engine(), Some(20));
    assert_eq!(backend.last_frame(21).unwrap().pixels[SIZE - 1], 0xaa);
    assert_eq!(backend.last_frame(20).unwrap().pixels[0], 0xbb);

    assert_eq!(left.status(flip(10)), 0);
    assert_eq!(right.status(flip(10)), 0);

    assert!(backend.complete_flip(20));
    assert_eq!(
        right.wait_for_events(1),
        vec![DisplEvent {
            id: 0,
            kind: DisplEventKind::PgFlip { fb_cookie: 10 },
        }]
    );
    assert!(left.transport.events().is_empty());
    assert_eq!(left.dispatcher.output().state(), OutputState::FlipPending);
    assert_eq!(right.dispatcher.output().state(), OutputState::Initialized);

    // The display buffer stays while a scanout buffer references it.
    assert_eq!(
        left.status(DisplCommand::DbufDestroy(DbufDestroyReq { dbuf_cookie: 1 })),
        -EBUSY
    );
    // Detaching the buffer being scanned out is allowed; the flip keeps it alive.
    assert_eq!(
        left.status(DisplCommand::FbDetach(FbDetachReq { fb_cookie: 10 })),
        0
    );
    assert_eq!(
        left.status(DisplCommand::DbufDestroy(DbufDestroyReq { dbuf_cookie: 1 })),
        0
    );
    assert_eq!(left.status(flip(10)), -ENOENT);

    assert!(backend.complete_flip(21));
    assert_eq!(left.wait_for_events(1).len(), 1);

    drop(left);
    assert_eq!(backend.engine_config(21).unwrap(), console);
    assert_eq!(device.engines().claimed(), vec![20]);

    drop(right);
    assert!(device.engines().claimed().is_empty());
    assert_eq!(backend.buffer_count(), 0);
    assert_eq!(backend.scanout_count(), 0);
}

#[test]
fn unplugged_connector_rejects_configuration() {
    init_tracing();
    let mut guest = Guest::new();
    let backend = software_backend(
        &guest,
        SoftwareBackendConfig {
            connectors: vec![connector(0, None)],
            ..Default::default()
        },
    );
    let device = DisplayDevice::start(backend.clone(), DisplbackConfig::default()).unwrap();
    let mut conn = Connection::open(&device, &guest, 0);
    let buffer = guest.share_buffer(SIZE, 0);
    conn.status(create(1, &buffer));
    conn.status(attach(1, 2));

    backend.set_connected(0, false);
    assert_eq!(conn.status(set_config(2)), -ENODEV);

    backend.set_connected(0, true);
    assert_eq!(conn.status(set_config(2)), 0);
}

#[test]
fn stopped_device_refuses_flips() {
    init_tracing();
    let mut guest = Guest::new();
    let backend = software_backend(
        &guest,
        SoftwareBackendConfig {
            connectors: vec![connector(0, None)],
            ..Default::default()
        },
    );
    let device = DisplayDevice::start(backend.clone(), DisplbackConfig::default()).unwrap();
    let mut conn = Connection::open(&device, &guest, 0);
    let buffer = guest.share_buffer(SIZE, 0);
    conn.status(create(1, &buffer));
    conn.status(attach(1, 2));
    conn.status(set_config(2));

    device.stop();
    assert_eq!(conn.status(flip(2)), -ESHUTDOWN);
    assert_eq!(conn.dispatcher.output().state(), OutputState::Initialized);
}
