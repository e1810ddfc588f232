use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError, TrySendError};
use hosted_framing::{BootupEvent, BootupInfo, IfType, PacketType, PayloadHeader, HEADER_LEN};
use shmem_ipc::{Delivery, IpcClient, IpcEndpoint, Outbound, Priority};
use shmem_transport::BufferHandle;

use crate::config::NetChannelConfig;
use crate::error::{NetError, NetResult};
use crate::stats::{NetStats, NetStatsSnapshot};

/// Client address of the primary data channel.
pub const NET_ADDRESS: u32 = 1;

/// Lane a frame of `if_type` travels on, in both directions.
pub fn lane_for(if_type: IfType) -> Priority {
    match if_type {
        IfType::Internal => Priority::High,
        IfType::Hci => Priority::Mid,
        _ => Priority::Low,
    }
}

/// A received frame, copied out of shared memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: PayloadHeader,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn if_type(&self) -> IfType {
        self.header.if_type
    }

    pub fn lane(&self) -> Priority {
        lane_for(self.header.if_type)
    }
}

/// Registry side of the channel; runs on the receive worker.
struct NetReceiver {
    lanes: [Sender<Frame>; 3],
    max_frame_size: usize,
    stats: Arc<NetStats>,
}

impl IpcClient for NetReceiver {
    fn on_receive(&self, address: u32, delivery: Delivery<'_>) {
        let view = match delivery {
            Delivery::Probe => {
                tracing::debug!(address, "ignoring probe on the data channel");
                return;
            }
            Delivery::Buffer(view) => view,
        };

        let (header, data) = match PayloadHeader::parse(view.as_slice(), self.max_frame_size) {
            Ok(parsed) => parsed,
            Err(err) => {
                NetStats::bump(&self.stats.malformed);
                tracing::warn!(address, buffer = ?view.buffer_ref(), %err, "dropping malformed frame");
                return;
            }
        };

        let lane = lane_for(header.if_type);
        let frame = Frame {
            header,
            data: data.to_vec(),
        };
        match self.lanes[lane.index()].try_send(frame) {
            Ok(()) => NetStats::bump(&self.stats.received),
            Err(TrySendError::Full(_)) => {
                NetStats::bump(&self.stats.rx_overflow);
                tracing::warn!(?lane, "receive lane full, dropping frame");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("net channel gone, dropping frame");
            }
        }
    }
}

/// The data channel bound to one endpoint.
pub struct NetChannel {
    endpoint: Arc<IpcEndpoint>,
    config: NetChannelConfig,
    lanes: [Receiver<Frame>; 3],
    stats: Arc<NetStats>,
    /// Weak so that unregistering drops the lane senders.
    receiver: Weak<NetReceiver>,
}

impl std::fmt::Debug for NetChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetChannel")
            .field("side", &self.endpoint.side())
            .field("pending", &self.pending())
            .finish()
    }
}

impl NetChannel {
    /// Registers the channel on `endpoint` at [`NET_ADDRESS`].
    pub fn attach(endpoint: Arc<IpcEndpoint>, config: NetChannelConfig) -> NetResult<Self> {
        config.validate(endpoint.pool().slot_size())?;

        let (high_tx, high_rx) = bounded(config.rx_lane_capacity);
        let (mid_tx, mid_rx) = bounded(config.rx_lane_capacity);
        let (low_tx, low_rx) = bounded(config.rx_lane_capacity);
        let stats = Arc::new(NetStats::default());
        let receiver = Arc::new(NetReceiver {
            lanes: [high_tx, mid_tx, low_tx],
            max_frame_size: config.max_frame_size,
            stats: Arc::clone(&stats),
        });
        let weak = Arc::downgrade(&receiver);
        endpoint.register(NET_ADDRESS, receiver)?;

        Ok(Self {
            endpoint,
            config,
            lanes: [high_rx, mid_rx, low_rx],
            stats,
            receiver: weak,
        })
    }

    pub fn config(&self) -> &NetChannelConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Arc<IpcEndpoint> {
        &self.endpoint
    }

    /// Frames `data` for `if_type` and queues it on the matching lane.
    /// Returns the number of data bytes accepted.
    pub fn write(
        &self,
        if_type: IfType,
        if_num: u8,
        packet_type: PacketType,
        data: &[u8],
    ) -> NetResult<usize> {
        if data.is_empty() {
            return Err(NetError::Empty);
        }
        if data.len() > self.config.max_frame_size {
            return Err(NetError::TooLarge {
                len: data.len(),
                max: self.config.max_frame_size,
            });
        }

        let mut buffer = self.endpoint.alloc()?;
        let header = PayloadHeader::new(if_type, if_num, packet_type, data.len() as u16);
        let total = HEADER_LEN + data.len();
        let slot = buffer.as_mut_slice();
        header.write_to(slot)?;
        slot[HEADER_LEN..total].copy_from_slice(data);
        buffer.set_len(total)?;

        self.submit(lane_for(if_type), buffer)?;
        Ok(data.len())
    }

    /// Announces the device to the host. Sent once per boot, on the high lane.
    pub fn send_bootup_event(&self, info: BootupInfo) -> NetResult<()> {
        let frame = BootupEvent::new(info).encode_frame()?;
        let mut buffer = self.endpoint.alloc()?;
        buffer.fill_from(&frame)?;
        self.submit(Priority::High, buffer)?;
        tracing::info!(side = self.endpoint.side().label(), "bootup event queued");
        Ok(())
    }

    fn submit(&self, priority: Priority, buffer: BufferHandle) -> NetResult<()> {
        self.endpoint
            .submit(NET_ADDRESS, priority, Outbound::Owned(buffer))
            .map_err(|rejected| NetError::Ipc(rejected.into_reason()))?;
        NetStats::bump(&self.stats.sent);
        Ok(())
    }

    /// Next frame in strict priority order, without blocking.
    pub fn try_read(&self) -> NetResult<Option<Frame>> {
        let mut closed = 0;
        for lane in &self.lanes {
            match lane.try_recv() {
                Ok(frame) => return Ok(Some(frame)),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => closed += 1,
            }
        }
        if closed == self.lanes.len() {
            Err(NetError::Closed)
        } else {
            Ok(None)
        }
    }

    /// Blocks until a frame is available, highest lane first.
    pub fn read(&self) -> NetResult<Frame> {
        self.read_until(None)
    }

    pub fn read_timeout(&self, timeout: Duration) -> NetResult<Frame> {
        self.read_until(Some(Instant::now() + timeout))
    }

    fn read_until(&self, deadline: Option<Instant>) -> NetResult<Frame> {
        loop {
            if let Some(frame) = self.try_read()? {
                return Ok(frame);
            }
            let mut select = Select::new();
            for lane in &self.lanes {
                select.recv(lane);
            }
            match deadline {
                None => {
                    select.ready();
                }
                Some(deadline) => {
                    if select.ready_deadline(deadline).is_err() {
                        return Err(NetError::Timeout);
                    }
                }
            }
        }
    }

    /// Frames waiting per receive lane, ordered as [High, Mid, Low].
    pub fn pending(&self) -> [usize; 3] {
        [self.lanes[0].len(), self.lanes[1].len(), self.lanes[2].len()]
    }

    pub fn stats(&self) -> NetStatsSnapshot {
        self.stats.snapshot()
    }

    /// Unregisters from the endpoint; readers then see [`NetError::Closed`]
    /// once the queued frames are gone.
    pub fn close(&self) {
        let Some(receiver) = self.receiver.upgrade() else {
            return;
        };
        let receiver: Arc<dyn IpcClient> = receiver;
        match self.endpoint.unregister_client(NET_ADDRESS, &receiver) {
            Ok(true) => tracing::debug!("net channel unregistered"),
            Ok(false) => {}
            Err(err) => tracing::error!(%err, "failed to unregister net channel"),
        }
    }
}

impl Drop for NetChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hosted_framing::{Capabilities, FirmwareInfo};
    use runtime_native::{LoopbackLink, SteppedLink};
    use shmem_ipc::IpcConfig;

    fn link() -> SteppedLink {
        LoopbackLink::new(&IpcConfig::default())
            .expect("loopback link")
            .into_stepped()
    }

    fn pair(link: &SteppedLink, config: NetChannelConfig) -> (NetChannel, NetChannel) {
        let device = NetChannel::attach(Arc::clone(&link.device), config).expect("device channel");
        let host = NetChannel::attach(Arc::clone(&link.host), config).expect("host channel");
        (device, host)
    }

    fn drain(channel: &NetChannel) -> Vec<(IfType, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(frame) = channel.try_read().expect("open") {
            out.push((frame.if_type(), frame.data));
        }
        out
    }

    #[test]
    fn lanes_follow_interface_type() {
        assert_eq!(lane_for(IfType::Internal), Priority::High);
        assert_eq!(lane_for(IfType::Hci), Priority::Mid);
        assert_eq!(lane_for(IfType::Sta), Priority::Low);
        assert_eq!(lane_for(IfType::Unknown(7)), Priority::Low);
    }

    #[test]
    fn frames_are_read_highest_lane_first() {
        let mut link = link();
        let (device, host) = pair(&link, NetChannelConfig::default());

        device.write(IfType::Sta, 0, PacketType::Data, b"sta").unwrap();
        device.write(IfType::Hci, 0, PacketType::Data, b"hci").unwrap();
        device.write(IfType::Ap, 1, PacketType::Data, b"ap").unwrap();
        device
            .write(IfType::Internal, 0, PacketType::Event, b"ctl")
            .unwrap();
        link.run_until_idle();

        assert_eq!(
            drain(&host),
            vec![
                (IfType::Internal, b"ctl".to_vec()),
                (IfType::Hci, b"hci".to_vec()),
                (IfType::Sta, b"sta".to_vec()),
                (IfType::Ap, b"ap".to_vec()),
            ]
        );
        assert_eq!(device.stats().sent, 4);
        assert_eq!(host.stats().received, 4);
        assert_eq!(link.device.pool().available(), link.device.pool().slot_count() as usize);
    }

    #[test]
    fn malformed_frame_is_dropped_and_counted() {
        let mut link = link();
        let (device, host) = pair(&link, NetChannelConfig::default());

        let mut bad = link.device.alloc().unwrap();
        let mut raw = [0u8; HEADER_LEN + 4];
        PayloadHeader::new(IfType::Sta, 0, PacketType::Data, 0)
            .write_to(&mut raw)
            .unwrap();
        bad.fill_from(&raw).unwrap();
        link.device
            .submit(NET_ADDRESS, Priority::Low, Outbound::Owned(bad))
            .unwrap();
        device.write(IfType::Sta, 0, PacketType::Data, b"ok").unwrap();
        link.run_until_idle();

        assert_eq!(host.stats().malformed, 1);
        assert_eq!(drain(&host), vec![(IfType::Sta, b"ok".to_vec())]);
    }

    #[test]
    fn full_receive_lane_drops_new_frames() {
        let mut link = link();
        let config = NetChannelConfig {
            rx_lane_capacity: 2,
            ..NetChannelConfig::default()
        };
        let (device, host) = pair(&link, config);
        for byte in 0..3u8 {
            device.write(IfType::Sta, 0, PacketType::Data, &[byte]).unwrap();
        }
        link.run_until_idle();

        assert_eq!(host.stats().rx_overflow, 1);
        assert_eq!(host.pending(), [0, 0, 2]);
        assert_eq!(
            drain(&host),
            vec![(IfType::Sta, vec![0]), (IfType::Sta, vec![1])]
        );
    }

    #[test]
    fn write_validates_length() {
        let link = link();
        let (device, _host) = pair(&link, NetChannelConfig::default());
        assert!(matches!(
            device.write(IfType::Sta, 0, PacketType::Data, &[]),
            Err(NetError::Empty)
        ));
        let big = vec![0u8; 1601];
        assert!(matches!(
            device.write(IfType::Sta, 0, PacketType::Data, &big),
            Err(NetError::TooLarge { len: 1601, max: 1600 })
        ));
        assert_eq!(device.stats().sent, 0);
    }

    #[test]
    fn bootup_event_reaches_the_host() {
        let mut link = link();
        let (device, host) = pair(&link, NetChannelConfig::default());
        let info = BootupInfo {
            chip_id: Some(0x0d),
            capabilities: Some(Capabilities::WLAN_SPI),
            raw_tp: Some(true),
            firmware: Some(FirmwareInfo {
                major1: 1,
                major2: 0,
                minor: 2,
                last_reset_reason: 1,
            }),
            ..BootupInfo::default()
        };
        device.write(IfType::Sta, 0, PacketType::Data, b"data").unwrap();
        device.send_bootup_event(info.clone()).unwrap();
        link.run_until_idle();

        let first = host.try_read().unwrap().expect("bootup frame");
        assert_eq!(first.if_type(), IfType::Internal);
        assert_eq!(first.header.packet_type, PacketType::Event);
        assert_eq!(BootupEvent::decode(&first.data).unwrap().info, info);
    }

    #[test]
    fn read_times_out_when_idle() {
        let link = link();
        let (_device, host) = pair(&link, NetChannelConfig::default());
        assert!(matches!(
            host.read_timeout(Duration::from_millis(10)),
            Err(NetError::Timeout)
        ));
    }

    #[test]
    fn closed_channel_reports_closed() {
        let link = link();
        let (_device, host) = pair(&link, NetChannelConfig::default());
        host.close();
        assert!(matches!(host.read(), Err(NetError::Closed)));
    }

    #[test]
    fn second_attach_replaces_the_first() {
        let link = link();
        let first = NetChannel::attach(Arc::clone(&link.host), NetChannelConfig::default()).unwrap();
        let _second =
            NetChannel::attach(Arc::clone(&link.host), NetChannelConfig::default()).unwrap();
        assert!(matches!(first.try_read(), Err(NetError::Closed)));
    }
}
