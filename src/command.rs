//! Command Parser/Dispatcher (component E): turns one line of the ASCII
//! command grammar into calls against the tracks, the service-mode driver,
//! the power supervisors, and the accessory registries, broadcasting a
//! response (if any) through the [`Printer`].
//!
//! Bracket framing (`<...>`) is applied and stripped by the transport, not
//! here; `dispatch` takes the bare line.

use crate::power::{EnableAction, PowerSupervisor};
use crate::printer::{Arg, Printer};
use crate::registry::{OutputRegistry, SensorRegistry, Store, TurnoutRegistry};
use crate::service_mode::{self, CurrentSense};
use crate::track::Track;

/// Identity reported by the `s` status dump.
pub struct Identity {
    pub name: &'static str,
    pub version: &'static str,
}

/// Parses up to `N` whitespace-separated decimal integers out of `s`,
/// stopping at the first token that doesn't parse (mirroring `sscanf`'s
/// "stop at first mismatch" behavior). Returns the matched count, or `-1`
/// if `s` has no tokens at all (the "no arguments" case the grammar table
/// keys its zero-argument forms on).
fn scan_ints<const N: usize>(s: &str) -> ([i32; N], i32) {
    let mut out = [0i32; N];
    let mut count = 0usize;
    for tok in s.split_whitespace() {
        if count >= N {
            break;
        }
        match tok.parse::<i32>() {
            Ok(v) => {
                out[count] = v;
                count += 1;
            }
            Err(_) => break,
        }
    }
    let argc = if count == 0 && s.trim().is_empty() {
        -1
    } else {
        count as i32
    };
    (out, argc)
}

/// Everything the dispatcher needs for one station. Bundled as plain owned
/// fields (no cross-referential lifetimes) so `dispatch` can take `&mut
/// self` plus a `&mut Printer` borrowed independently by the caller.
pub struct Dispatcher<S: CurrentSense, R, St: Store> {
    pub main_track: Track,
    pub prog_track: Track,
    pub prog_sense: S,
    pub main_power: PowerSupervisor,
    pub prog_power: PowerSupervisor,
    pub registries: R,
    pub store: St,
    pub identity: Identity,
}

impl<S, R, St> Dispatcher<S, R, St>
where
    S: CurrentSense,
    R: TurnoutRegistry + OutputRegistry + SensorRegistry,
    St: Store,
{
    /// Dispatches one already-unframed command line, broadcasting any
    /// response through `printer`. Returns the enable-pin action the caller
    /// should apply to the main/programming tracks this call — `Hold` for
    /// every command except `1`/`0`, which is why the return type exists at
    /// all: the supervisors themselves don't own the enable pins (see
    /// `power::PowerSupervisor`'s docs), so the one command that changes
    /// their armed state has to hand the action back up to whoever does.
    pub fn dispatch(&mut self, line: &str, printer: &mut Printer) -> (EnableAction, EnableAction) {
        let mut bytes = line.bytes();
        let first = match bytes.next() {
            Some(b) => b,
            None => return (EnableAction::Hold, EnableAction::Hold),
        };
        let rest = &line[1..];

        match first {
            b't' => self.cmd_throttle(rest, printer),
            b'f' => self.cmd_function(rest),
            b'a' => self.cmd_accessory(rest),
            b'T' => self.cmd_turnout(rest, printer),
            b'Z' => self.cmd_output(rest, printer),
            b'S' => self.cmd_sensor(rest, printer),
            b'Q' => self.cmd_sensor_status(printer),
            b'w' => self.cmd_write_cv_byte_main(rest),
            b'b' => self.cmd_write_cv_bit_main(rest),
            b'W' => self.cmd_write_cv_byte(rest, printer),
            b'B' => self.cmd_write_cv_bit(rest, printer),
            b'R' => self.cmd_read_cv(rest, printer),
            b'1' => return self.cmd_power(true, printer),
            b'0' => return self.cmd_power(false, printer),
            b'c' => self.cmd_read_current(printer),
            b's' => self.cmd_status(printer),
            b'E' => self.cmd_store(printer),
            b'e' => self.cmd_clear_store(printer),
            b' ' => {
                let _ = printer.broadcast("\n", &[]);
            }
            _ => {
                defmt::warn!("unrecognized command byte");
            }
        }

        (EnableAction::Hold, EnableAction::Hold)
    }

    fn cmd_throttle(&mut self, rest: &str, printer: &mut Printer) {
        let ([n_dev, cab, speed, direction], argc) = scan_ints::<4>(rest);
        if argc < 4 {
            defmt::warn!("malformed t command");
            return;
        }
        match self.main_track.set_throttle(
            n_dev as u8,
            cab as u16,
            speed as i8,
            direction != 0,
        ) {
            Ok(resp) => {
                let _ = printer.broadcast(
                    "<T %d %d %d>",
                    &[
                        Arg::Int(resp.device as i32),
                        Arg::Int(resp.speed as i32),
                        Arg::Int(resp.direction as i32),
                    ],
                );
            }
            Err(_) => defmt::warn!("setThrottle rejected"),
        }
    }

    fn cmd_function(&mut self, rest: &str) {
        let ([cab, byte1, byte2], argc) = scan_ints::<3>(rest);
        let result = if argc == 2 {
            self.main_track.set_function(cab as u16, byte1 as u8)
        } else if argc == 3 {
            self.main_track
                .set_function_ext(cab as u16, byte1 as u8, byte2 as u8)
        } else {
            defmt::warn!("malformed f command");
            return;
        };
        if result.is_err() {
            defmt::warn!("setFunction rejected");
        }
    }

    fn cmd_accessory(&mut self, rest: &str) {
        let ([address, number, activate], argc) = scan_ints::<3>(rest);
        if argc < 3 {
            defmt::warn!("malformed a command");
            return;
        }
        if self
            .main_track
            .set_accessory(address as u16, number as u8, activate != 0)
            .is_err()
        {
            defmt::warn!("setAccessory rejected");
        }
    }

    fn cmd_turnout(&mut self, rest: &str, printer: &mut Printer) {
        let ([n, s, m], argc) = scan_ints::<3>(rest);
        match argc {
            2 => {
                let id = n as u16;
                if TurnoutRegistry::get(&self.registries, id).is_some() {
                    match TurnoutRegistry::activate(&mut self.registries, id, s != 0, &mut self.main_track) {
                        Ok(thrown) => {
                            let _ = printer.broadcast(
                                "<H %d %d>",
                                &[Arg::Int(id as i32), Arg::Int(thrown as i32)],
                            );
                        }
                        Err(_) => {
                            let _ = printer.broadcast("<X>", &[]);
                        }
                    }
                } else {
                    let _ = printer.broadcast("<X>", &[]);
                }
            }
            3 => {
                let _ = TurnoutRegistry::create(&mut self.registries, n as u16, s as u16, m as u8);
            }
            1 => {
                let _ = TurnoutRegistry::remove(&mut self.registries, n as u16);
            }
            -1 => {
                for (id, turnout) in TurnoutRegistry::iter(&self.registries) {
                    let _ = printer.broadcast(
                        "<H %d %d>",
                        &[Arg::Int(*id as i32), Arg::Int(turnout.thrown as i32)],
                    );
                }
            }
            _ => {}
        }
    }

    fn cmd_output(&mut self, rest: &str, printer: &mut Printer) {
        let ([on, os, om], argc) = scan_ints::<3>(rest);
        match argc {
            2 => {
                let id = on as u16;
                // The fixed `o != NULL` check, not the original's stray `t != NULL`.
                if OutputRegistry::get(&self.registries, id).is_some() {
                    match OutputRegistry::activate(&mut self.registries, id, os != 0) {
                        Ok(active) => {
                            let _ = printer.broadcast(
                                "<Y %d %d>",
                                &[Arg::Int(id as i32), Arg::Int(active as i32)],
                            );
                        }
                        Err(_) => {
                            let _ = printer.broadcast("<X>", &[]);
                        }
                    }
                } else {
                    let _ = printer.broadcast("<X>", &[]);
                }
            }
            3 => {
                let _ = OutputRegistry::create(&mut self.registries, on as u16, os as u8, om != 0);
            }
            1 => {
                let _ = OutputRegistry::remove(&mut self.registries, on as u16);
            }
            -1 => {
                for (id, output) in OutputRegistry::iter(&self.registries) {
                    let _ = printer.broadcast(
                        "<Y %d %d>",
                        &[Arg::Int(*id as i32), Arg::Int(output.active as i32)],
                    );
                }
            }
            _ => {}
        }
    }

    fn cmd_sensor(&mut self, rest: &str, printer: &mut Printer) {
        let ([sn, ss, sm], argc) = scan_ints::<3>(rest);
        match argc {
            3 => {
                let _ = SensorRegistry::create(&mut self.registries, sn as u16, ss as u8, sm != 0);
            }
            1 => {
                let _ = SensorRegistry::remove(&mut self.registries, sn as u16);
            }
            2 => {
                let _ = printer.broadcast("<X>", &[]);
            }
            _ => {}
        }
    }

    fn cmd_sensor_status(&mut self, printer: &mut Printer) {
        for (id, sensor) in SensorRegistry::iter(&self.registries) {
            let token = if sensor.active { "<Q %d>" } else { "<q %d>" };
            let _ = printer.broadcast(token, &[Arg::Int(*id as i32)]);
        }
    }

    fn cmd_write_cv_byte_main(&mut self, rest: &str) {
        let ([cab, cv, value], argc) = scan_ints::<3>(rest);
        if argc < 3 {
            defmt::warn!("malformed w command");
            return;
        }
        let _ = self
            .main_track
            .write_cv_byte_main(cab as u16, cv as u16, value as u8);
    }

    fn cmd_write_cv_bit_main(&mut self, rest: &str) {
        let ([cab, cv, bit, value], argc) = scan_ints::<4>(rest);
        if argc < 4 {
            defmt::warn!("malformed b command");
            return;
        }
        let _ = self
            .main_track
            .write_cv_bit_main(cab as u16, cv as u16, bit as u8, value as u8);
    }

    fn cmd_write_cv_byte(&mut self, rest: &str, printer: &mut Printer) {
        let ([cv, value, cn, cs], argc) = scan_ints::<4>(rest);
        if argc < 4 {
            defmt::warn!("malformed W command");
            return;
        }
        if let Ok(resp) = service_mode::write_cv_byte(
            &mut self.prog_track,
            &mut self.prog_sense,
            cv as u16,
            value as u8,
            cn as u16,
            cs as u16,
        ) {
            let _ = printer.broadcast(
                "<r%d|%d|%d %d>",
                &[
                    Arg::Int(resp.callback as i32),
                    Arg::Int(resp.callback_sub as i32),
                    Arg::Int(resp.cv as i32),
                    Arg::Int(resp.value as i32),
                ],
            );
        }
    }

    fn cmd_write_cv_bit(&mut self, rest: &str, printer: &mut Printer) {
        let ([cv, bit, value, cn, cs], argc) = scan_ints::<5>(rest);
        if argc < 5 {
            defmt::warn!("malformed B command");
            return;
        }
        if let Ok(resp) = service_mode::write_cv_bit(
            &mut self.prog_track,
            &mut self.prog_sense,
            cv as u16,
            bit as u8,
            value as u8,
            cn as u16,
            cs as u16,
        ) {
            let _ = printer.broadcast(
                "<r%d|%d|%d %d %d>",
                &[
                    Arg::Int(resp.callback as i32),
                    Arg::Int(resp.callback_sub as i32),
                    Arg::Int(resp.cv as i32),
                    Arg::Int(resp.bit as i32),
                    Arg::Int(resp.value as i32),
                ],
            );
        }
    }

    fn cmd_read_cv(&mut self, rest: &str, printer: &mut Printer) {
        let ([cv, cn, cs], argc) = scan_ints::<3>(rest);
        if argc < 3 {
            defmt::warn!("malformed R command");
            return;
        }
        if let Ok(resp) =
            service_mode::read_cv(&mut self.prog_track, &mut self.prog_sense, cv as u16, cn as u16, cs as u16)
        {
            let _ = printer.broadcast(
                "<r%d|%d|%d %d>",
                &[
                    Arg::Int(resp.callback as i32),
                    Arg::Int(resp.callback_sub as i32),
                    Arg::Int(resp.cv as i32),
                    Arg::Int(resp.value as i32),
                ],
            );
        }
    }

    fn cmd_power(&mut self, on: bool, printer: &mut Printer) -> (EnableAction, EnableAction) {
        let actions = if on {
            let actions = (self.main_power.power_on(), self.prog_power.power_on());
            let _ = printer.broadcast("<p1>", &[]);
            actions
        } else {
            let actions = (self.main_power.power_off(), self.prog_power.power_off());
            let _ = printer.broadcast("<p0>", &[]);
            actions
        };
        actions
    }

    fn cmd_read_current(&mut self, printer: &mut Printer) {
        let _ = printer.broadcast("<a %d>", &[Arg::Int(self.main_power.get_last_read() as i32)]);
    }

    fn cmd_status(&mut self, printer: &mut Printer) {
        for i in 1..=self.main_track.num_dev() {
            match self.main_track.speed_table_entry(i) {
                Some(0) | None => continue,
                Some(speed) => {
                    let _ = printer.broadcast(
                        "<T%d %d %d>",
                        &[
                            Arg::Int(i as i32),
                            Arg::Int(speed.unsigned_abs() as i32),
                            Arg::Int((speed > 0) as i32),
                        ],
                    );
                }
            }
        }

        let _ = printer.broadcast(
            "<i%s V-%s>",
            &[Arg::Str(self.identity.name), Arg::Str(self.identity.version)],
        );

        for (id, turnout) in TurnoutRegistry::iter(&self.registries) {
            let _ = printer.broadcast(
                "<H %d %d>",
                &[Arg::Int(*id as i32), Arg::Int(turnout.thrown as i32)],
            );
        }
        for (id, output) in OutputRegistry::iter(&self.registries) {
            let _ = printer.broadcast(
                "<Y %d %d>",
                &[Arg::Int(*id as i32), Arg::Int(output.active as i32)],
            );
        }
    }

    fn cmd_store(&mut self, printer: &mut Printer) {
        match self
            .store
            .store(&self.registries, &self.registries, &self.registries)
        {
            Ok((n_turnouts, n_sensors, n_outputs)) => {
                let _ = printer.broadcast(
                    "<e %d %d %d>",
                    &[
                        Arg::Int(n_turnouts as i32),
                        Arg::Int(n_sensors as i32),
                        Arg::Int(n_outputs as i32),
                    ],
                );
            }
            Err(_) => {
                let _ = printer.broadcast("<X>", &[]);
            }
        }
    }

    fn cmd_clear_store(&mut self, printer: &mut Printer) {
        self.store.clear();
        let _ = printer.broadcast("<O>", &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::PowerSupervisor;
    use crate::registry::{InMemoryRegistries, NullStore};
    use crate::track::HardwareDescriptor;
    use crate::waveform::ControlScheme;
    use heapless::String;

    struct FlatSense;
    impl CurrentSense for FlatSense {
        fn sample(&mut self) -> f32 {
            100.0
        }
    }

    struct Recorder {
        messages: heapless::Vec<String<128>, 16>,
    }
    impl Recorder {
        fn new() -> Self {
            Self { messages: heapless::Vec::new() }
        }
    }
    impl crate::printer::Transport for Recorder {
        fn send(&mut self, message: &str) {
            let _ = self.messages.push(String::from(message));
        }
    }

    fn hdw() -> HardwareDescriptor {
        HardwareDescriptor {
            control_scheme: ControlScheme::DualDirection,
            current_conversion_factor: 1.0,
            trigger_ma: 2_000.0,
        }
    }

    fn dispatcher() -> Dispatcher<FlatSense, InMemoryRegistries, NullStore> {
        Dispatcher {
            main_track: Track::new(hdw(), 4),
            prog_track: Track::new(hdw(), 1),
            prog_sense: FlatSense,
            main_power: PowerSupervisor::new(2_000.0, 1.0),
            prog_power: PowerSupervisor::new(250.0, 1.0),
            registries: InMemoryRegistries::new(),
            store: NullStore,
            identity: Identity { name: "TEST", version: "0.0" },
        }
    }

    #[test]
    fn throttle_command_updates_speed_table_and_responds() {
        let mut d = dispatcher();
        let mut printer = Printer::new();
        let mut rec = Recorder::new();
        printer.register(&mut rec);

        d.dispatch("t1 3 64 1", &mut printer);

        assert_eq!(d.main_track.speed_table_entry(1), Some(64));
        assert_eq!(rec.messages.last().unwrap().as_str(), "<T 1 64 1>");
    }

    #[test]
    fn turnout_create_then_activate_schedules_accessory_and_reports_state() {
        let mut d = dispatcher();
        let mut printer = Printer::new();
        let mut rec = Recorder::new();
        printer.register(&mut rec);

        d.dispatch("T3 100 2", &mut printer);
        d.dispatch("T3 1", &mut printer);

        assert_eq!(
            TurnoutRegistry::get(&d.registries, 3).unwrap().thrown,
            true
        );
        assert_eq!(rec.messages.last().unwrap().as_str(), "<H 3 1>");
    }

    #[test]
    fn output_activate_on_unknown_id_reports_error_not_a_stale_turnout() {
        let mut d = dispatcher();
        let mut printer = Printer::new();
        let mut rec = Recorder::new();
        printer.register(&mut rec);

        // A `T` command runs first so a stale turnout pointer would, in the
        // original's buggy `if(t != NULL)` check, wrongly read as non-null.
        d.dispatch("T3 100 2", &mut printer);
        d.dispatch("Z9 1", &mut printer);

        assert_eq!(rec.messages.last().unwrap().as_str(), "<X>");
    }

    #[test]
    fn sensor_two_args_is_invalid() {
        let mut d = dispatcher();
        let mut printer = Printer::new();
        let mut rec = Recorder::new();
        printer.register(&mut rec);

        d.dispatch("S1 2", &mut printer);

        assert_eq!(rec.messages.last().unwrap().as_str(), "<X>");
    }

    #[test]
    fn power_commands_report_and_return_enable_actions() {
        let mut d = dispatcher();
        let mut printer = Printer::new();
        let mut rec = Recorder::new();
        printer.register(&mut rec);

        let (main_action, prog_action) = d.dispatch("1", &mut printer);
        assert_eq!(main_action, EnableAction::Assert);
        assert_eq!(prog_action, EnableAction::Assert);
        assert_eq!(rec.messages.last().unwrap().as_str(), "<p1>");

        let (main_action, prog_action) = d.dispatch("0", &mut printer);
        assert_eq!(main_action, EnableAction::Deassert);
        assert_eq!(prog_action, EnableAction::Deassert);
        assert_eq!(rec.messages.last().unwrap().as_str(), "<p0>");
    }

    #[test]
    fn current_command_reports_last_read() {
        let mut d = dispatcher();
        let mut printer = Printer::new();
        let mut rec = Recorder::new();
        printer.register(&mut rec);

        d.dispatch("c", &mut printer);

        assert_eq!(rec.messages.last().unwrap().as_str(), "<a 0>");
    }

    #[test]
    fn space_command_sends_bare_newline() {
        let mut d = dispatcher();
        let mut printer = Printer::new();
        let mut rec = Recorder::new();
        printer.register(&mut rec);

        d.dispatch(" ", &mut printer);

        assert_eq!(rec.messages.last().unwrap().as_str(), "\n");
    }

    #[test]
    fn store_and_clear_report_counts() {
        let mut d = dispatcher();
        let mut printer = Printer::new();
        let mut rec = Recorder::new();
        printer.register(&mut rec);

        d.dispatch("T3 100 2", &mut printer);
        d.dispatch("E", &mut printer);
        assert_eq!(rec.messages.last().unwrap().as_str(), "<e 1 0 0>");

        d.dispatch("e", &mut printer);
        assert_eq!(rec.messages.last().unwrap().as_str(), "<O>");
    }
}
