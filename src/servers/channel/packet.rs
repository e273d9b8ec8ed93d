//! Wire messages emitted by the channel core.
//!
//! Three audiences: the center coordinator (1-byte opcodes), game clients
//! (2-byte opcodes), and sibling channels (2-byte opcodes in the 0x07xx
//! range). All multi-byte fields are little-endian.

use bytes::{BufMut, BytesMut};

// ── Center link (channel → center coordinator) ───────────────────────────────

pub const CENTER_POPULATION_CHANGED: u8 = 0x04;
pub const CENTER_CHANNEL_PORT: u8 = 0x05;

// ── Client (channel → game client) ───────────────────────────────────────────

pub const CLIENT_ENABLE_ACTIONS: u16 = 0x0115;
pub const CLIENT_CHANNEL_HOST: u16 = 0x0110;

// ── Inter-channel (channel ↔ channel) ────────────────────────────────────────

pub const CHAN_CHANGE_REQUEST: u16 = 0x0701;
pub const CHAN_CHANGE_ACCEPTED: u16 = 0x0702;

/// Port value reported to the center while the client listener is unbound.
pub const PORT_UNBOUND: i32 = -1;

/// `[opcode:1][channel:1][count:2]`, sent after every directory mutation.
pub fn write_population_changed(channel: u8, count: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(CENTER_POPULATION_CHANGED);
    buf.put_u8(channel);
    buf.put_u16_le(count);
    buf.to_vec()
}

/// `[opcode:1][world:1][channel:1][port:4]`; `None` serializes as -1.
pub fn write_channel_port(world: u8, channel: u8, port: Option<u16>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(7);
    buf.put_u8(CENTER_CHANNEL_PORT);
    buf.put_u8(world);
    buf.put_u8(channel);
    buf.put_i32_le(port.map_or(PORT_UNBOUND, i32::from));
    buf.to_vec()
}

/// `[opcode:2]`, re-enables client input after a failed or timed-out handoff.
pub fn write_enable_actions() -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u16_le(CLIENT_ENABLE_ACTIONS);
    buf.to_vec()
}

/// `[opcode:2][0x01][host:4][port:2]`, points the client at its new channel.
pub fn write_channel_host(host: [u8; 4], port: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u16_le(CLIENT_CHANNEL_HOST);
    buf.put_u8(0x01);
    buf.put_slice(&host);
    buf.put_u16_le(port);
    buf.to_vec()
}

/// `[opcode:2][src_channel:1][player_id:4][len:4][payload]`; the payload is
/// the zlib-compressed continuation snapshot.
pub fn write_change_request(src_channel: u8, player_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(11 + payload.len());
    buf.put_u16_le(CHAN_CHANGE_REQUEST);
    buf.put_u8(src_channel);
    buf.put_u32_le(player_id);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.to_vec()
}

/// `[opcode:2][player_id:4]`, sent once the destination accepts the player.
pub fn write_change_accepted(player_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16_le(CHAN_CHANGE_ACCEPTED);
    buf.put_u32_le(player_id);
    buf.to_vec()
}
