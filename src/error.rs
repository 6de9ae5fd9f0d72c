//! Crate-wide error taxonomy.

/// Failure modes surfaced by the packet engine, service-mode driver, and
/// command dispatcher. None of these are panics: every fallible primitive
/// returns one of these through a `Result`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum Error {
    /// A numeric argument fell outside the addressed object's configured bounds,
    /// e.g. a throttle device index greater than `numDev`.
    OutOfRange,
    /// A turnout/sensor/output id referenced by the command has no registry entry.
    NotFound,
    /// A service-mode verification ran to completion without detecting an ACK pulse.
    /// Not surfaced as a command failure; carried inside the normal `<r ...>` reply
    /// as a `-1` value.
    AckMissing,
    /// The command's argument count didn't match any accepted form for its verb.
    MalformedCommand,
    /// The track's power enable tripped on overcurrent. Recovery is automatic.
    Overcurrent,
    /// `schedulePacket` was asked to stage a payload over `PACKET_MAX`.
    PacketTooLong,
    /// A `Store::store` call was issued while a previous store hadn't
    /// finished yet (the backing write — flash or otherwise — is still
    /// in flight). The registries are left untouched; the caller should
    /// retry.
    StorePending,
    /// The broadcast printer already has `MAX_INTERFACES` transports registered.
    TransportFull,
}
