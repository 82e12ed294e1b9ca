#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use pvdisplay_backend::{
    CommandDispatcher, DisplayDevice, GrantTable, RecordingTransport, SoftwareBackend,
    SoftwareBackendConfig,
};
use pvdisplay_protocol::directory::{
    directory_pages_for_grefs, grefs_for_size, read_directory_grefs,
};
use pvdisplay_protocol::displif::{DisplCommand, DisplEvent, DisplRequest, DisplResponse};
use pvdisplay_protocol::{GrantRef, PAGE_SIZE};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Guest side of the grant table: hands out grant ids and shares pages with the host.
pub struct Guest {
    pub table: Arc<GrantTable>,
    next_gref: GrantRef,
}

/// A buffer shared by the guest: where its directory chain starts and which pages hold data.
pub struct SharedBuffer {
    pub directory_start: GrantRef,
    pub data: Vec<GrantRef>,
}

impl Guest {
    pub fn new() -> Self {
        Self {
            table: Arc::new(GrantTable::new()),
            next_gref: 1,
        }
    }

    fn grefs(&mut self, count: usize) -> Vec<GrantRef> {
        let start = self.next_gref;
        self.next_gref += count as GrantRef;
        (start..self.next_gref).collect()
    }

    /// Share `size` bytes filled with `fill`, plus the directory chain describing them.
    pub fn share_buffer(&mut self, size: usize, fill: u8) -> SharedBuffer {
        let data = self.grefs(grefs_for_size(size));
        let directory = self.grefs(directory_pages_for_grefs(data.len()).max(1));
        for gref in &data {
            self.table.share_page(*gref, &[fill; PAGE_SIZE]);
        }
        self.table.share_directory_chain(&directory, &data);
        SharedBuffer {
            directory_start: directory[0],
            data,
        }
    }

    /// Share empty directory pages for the host to fill in.
    pub fn share_empty_directory(&mut self, pages: usize) -> GrantRef {
        let directory = self.grefs(pages);
        self.table.share_directory_chain(&directory, &[]);
        directory[0]
    }

    /// Read back the first `count` references the host wrote into a single directory page.
    pub fn read_directory(&self, gref: GrantRef, count: usize) -> Vec<GrantRef> {
        let page = self.table.read_page(gref).expect("directory page is shared");
        let mut out = Vec::new();
        read_directory_grefs(&page, count, &mut out);
        out
    }
}

pub fn software_backend(guest: &Guest, config: SoftwareBackendConfig) -> Arc<SoftwareBackend> {
    Arc::new(SoftwareBackend::new(config, guest.table.clone()))
}

/// One frontend connection: encodes requests and collects what the backend sends back.
pub struct Connection {
    pub dispatcher: CommandDispatcher,
    pub transport: Arc<RecordingTransport>,
    next_id: u16,
}

impl Connection {
    pub fn open(device: &Arc<DisplayDevice>, guest: &Guest, connector: u32) -> Self {
        let transport = Arc::new(RecordingTransport::new());
        Self {
            dispatcher: CommandDispatcher::new(
                device,
                guest.table.clone(),
                connector,
                transport.clone(),
            ),
            transport,
            next_id: 0,
        }
    }

    pub fn send(&mut self, command: DisplCommand) -> DisplResponse {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let record = DisplRequest { id, command }.encode_to_le_bytes();
        self.dispatcher
            .process_request(&record)
            .expect("full records always get a response")
    }

    pub fn status(&mut self, command: DisplCommand) -> i32 {
        self.send(command).status
    }

    pub fn wait_for_events(&self, count: usize) -> Vec<DisplEvent> {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            let events = self.transport.events();
            if events.len() >= count || Instant::now() >= deadline {
                return events;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
