#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]

mod clock;
mod command;
mod config;
mod engine;
mod error;
mod packet;
mod power;
mod printer;
mod registry;
mod service_mode;
mod track;
mod waveform;

#[cfg(not(test))]
use defmt_rtt as _;
#[cfg(not(test))]
use panic_probe as _;

#[cfg(not(test))]
#[rtic::app(device = pac, peripherals = true, dispatchers = [EXTI9_5, EXTI15_10])]
mod app {
    use core::cell::RefCell;

    use cfg_if::cfg_if;
    use cortex_m::interrupt::Mutex;
    use defmt::println;
    use hal::{
        adc::{Adc, AdcConfig, AdcDevice, OperationMode, SampleTime},
        clocks::{Clocks, InputSrc, PllSrc},
        flash::Flash,
        gpio::{OutputType, Pin, PinMode, Port},
        pac,
        timer::{Timer, TimerInterrupt},
        usart::{Usart, UsartConfig, UsartInterrupt},
    };
    use heapless::String;
    use usb_device::prelude::*;
    use usbd_serial::SerialPort;

    use crate::clock::{self, MillisClock};
    use crate::command::{Dispatcher, Identity};
    use crate::config::StationCfg;
    use crate::power::{EnableAction, PowerSupervisor};
    use crate::printer::{Printer, Transport};
    use crate::registry::{InMemoryRegistries, NullStore};
    use crate::service_mode::CurrentSense;
    use crate::track::Track;
    use crate::waveform::{OutputLine, TrackPins, WaveformGenerator};

    const CMD_LINE_CAP: usize = 64;
    const VERSION: &str = "1.0.0";
    const STATION_NAME: &str = "RAILCOMMAND";

    cfg_if! {
        if #[cfg(feature = "h7")] {
            use hal::clocks::{PllCfg, VosRange};
            pub use pac::{ADC1 as ADC, USART2 as UART_CMD};
        } else if #[cfg(feature = "g4")] {
            pub use pac::{ADC2 as ADC, USART2 as UART_CMD};
        }
    }

    impl OutputLine for Pin {
        fn set_high(&mut self) {
            Pin::set_high(self);
        }
        fn set_low(&mut self) {
            Pin::set_low(self);
        }
    }

    /// The single onboard current-sense ADC, shared between the power-tick
    /// task and the service-mode driver's ACK sampling (which runs to
    /// completion inside `cmd_rx`, a different priority and a different
    /// borrow context than `power_tick`). A critical-section mutex is the
    /// simplest way to let both reach the same converter without making it
    /// an RTIC resource both tasks would otherwise have to list.
    static ADC_HANDLE: Mutex<RefCell<Option<Adc<ADC>>>> = Mutex::new(RefCell::new(None));

    /// `channel` 0 is the main track, 1 is the programming track.
    fn read_current(channel: u8) -> f32 {
        cortex_m::interrupt::free(|cs| {
            let mut adc = ADC_HANDLE.borrow(cs).borrow_mut();
            adc.as_mut().map(|adc| adc.read(channel) as f32).unwrap_or(0.0)
        })
    }

    /// The service-mode driver's [`CurrentSense`] handle for the programming
    /// track. Zero-sized so it can live inside the `Shared`-resident
    /// [`Dispatcher`] without borrowing anything; every sample reaches the
    /// ADC through [`ADC_HANDLE`].
    struct ProgSense;
    impl CurrentSense for ProgSense {
        fn sample(&mut self) -> f32 {
            read_current(1)
        }
    }

    struct UsartTransport<'a>(&'a mut Usart<UART_CMD>);
    impl<'a> Transport for UsartTransport<'a> {
        fn send(&mut self, message: &str) {
            let _ = self.0.write(message.as_bytes());
        }
    }

    type UsbBusType = usb_device::bus::UsbBusAllocator<hal::usb::UsbBus>;

    struct UsbTransport<'a> {
        serial: &'a mut SerialPort<'static, hal::usb::UsbBus>,
    }
    impl<'a> Transport for UsbTransport<'a> {
        fn send(&mut self, message: &str) {
            let _ = self.serial.write(message.as_bytes());
        }
    }

    static mut USB_BUS: Option<UsbBusType> = None;

    #[shared]
    struct Shared {
        dispatcher: Dispatcher<ProgSense, InMemoryRegistries, NullStore>,
        main_enable: Pin,
        prog_enable: Pin,
        usb_dev: UsbDevice<'static, hal::usb::UsbBus>,
        usb_serial: SerialPort<'static, hal::usb::UsbBus>,
    }

    #[local]
    struct Local {
        main_pins: TrackPins<Pin, Pin>,
        prog_pins: TrackPins<Pin, Pin>,
        main_waveform: WaveformGenerator,
        prog_waveform: WaveformGenerator,
        bit_timer: Timer<pac::TIM2>,
        power_timer: Timer<pac::TIM3>,
        millis_timer: Timer<pac::TIM4>,
        cmd_uart: Usart<UART_CMD>,
        cmd_line: String<CMD_LINE_CAP>,
        flash: Flash,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let mut cp = cx.core;
        let dp = cx.device;

        cp.SCB.enable_icache();

        cfg_if! {
            if #[cfg(feature = "h7")] {
                let clock_cfg = Clocks {
                    pll_src: PllSrc::Hse(16_000_000),
                    pll1: PllCfg { divm: 8, ..Default::default() },
                    hsi48_on: true,
                    usb_src: hal::clocks::UsbSrc::Hsi48,
                    ..Clocks::full_speed()
                };
            } else {
                let clock_cfg = Clocks {
                    input_src: InputSrc::Pll(PllSrc::Hse(16_000_000)),
                    hsi48_on: true,
                    ..Default::default()
                };
            }
        }
        clock_cfg.setup().unwrap();

        let mut flash = Flash::new(dp.FLASH);
        let cfg = StationCfg::load(&mut flash);

        let main_signal_a = Pin::new(Port::A, 0, PinMode::Output(OutputType::PushPull));
        let main_signal_b = Pin::new(Port::A, 1, PinMode::Output(OutputType::PushPull));
        let prog_signal_a = Pin::new(Port::B, 0, PinMode::Output(OutputType::PushPull));
        let prog_signal_b = Pin::new(Port::B, 1, PinMode::Output(OutputType::PushPull));
        let mut main_enable = Pin::new(Port::A, 2, PinMode::Output(OutputType::PushPull));
        let mut prog_enable = Pin::new(Port::B, 2, PinMode::Output(OutputType::PushPull));
        main_enable.set_low();
        prog_enable.set_low();

        let main_pins = TrackPins::new(main_signal_a, main_signal_b);
        let prog_pins = TrackPins::new(prog_signal_a, prog_signal_b);

        let mut main_track = Track::new(cfg.main, cfg.num_dev);
        let prog_track = Track::new(cfg.prog, 1);

        let main_waveform = WaveformGenerator::new(&mut main_track.engine);
        let mut prog_track = prog_track;
        let prog_waveform = WaveformGenerator::new(&mut prog_track.engine);

        // One free-running timer per track clocks the waveform's half-bit
        // cadence (NMRA S-9.1's ~58us '1'-bit half-period).
        let mut bit_timer = Timer::new_tim2(dp.TIM2, 2.0 * 58_000.0, Default::default(), &clock_cfg);
        bit_timer.enable_interrupt(TimerInterrupt::Update);

        // Power supervisor tick, ~1kHz (`CURRENT_SAMPLE_TIME`).
        let mut power_timer = Timer::new_tim3(dp.TIM3, 1_000.0, Default::default(), &clock_cfg);
        power_timer.enable_interrupt(TimerInterrupt::Update);

        // Millisecond clock backing `power::Clock`.
        let mut millis_timer = Timer::new_tim4(dp.TIM4, 1_000.0, Default::default(), &clock_cfg);
        millis_timer.enable_interrupt(TimerInterrupt::Update);

        let adc_cfg = AdcConfig {
            operation_mode: OperationMode::Continuous,
            ..Default::default()
        };
        #[cfg(feature = "h7")]
        let mut adc = Adc::new_adc1(dp.ADC1, AdcDevice::One, adc_cfg, &clock_cfg);
        #[cfg(feature = "g4")]
        let mut adc = Adc::new_adc2(dp.ADC2, AdcDevice::Two, adc_cfg, &clock_cfg);
        adc.set_sample_time(0, SampleTime::T601);
        adc.set_sample_time(1, SampleTime::T601);
        cortex_m::interrupt::free(|cs| *ADC_HANDLE.borrow(cs).borrow_mut() = Some(adc));

        let mut cmd_uart = Usart::new(dp.USART2, 115_200, UsartConfig::default(), &clock_cfg);
        cmd_uart.enable_interrupt(UsartInterrupt::ReadNotEmpty);

        cfg_if! {
            if #[cfg(feature = "h7")] {
                let usb = hal::usb_otg::Usb1::new(dp.OTG1_HS_GLOBAL, dp.OTG1_HS_DEVICE, dp.OTG1_HS_PWRCLK, clock_cfg.hclk(), clock_cfg.usb());
            } else {
                let usb = hal::usb::Peripheral { regs: dp.USB };
            }
        }
        let usb_bus = hal::usb::UsbBus::new(usb);
        unsafe {
            USB_BUS = Some(usb_bus);
        }
        let usb_bus_ref = unsafe { USB_BUS.as_ref().unwrap() };
        let usb_serial = SerialPort::new(usb_bus_ref);
        let usb_dev = UsbDeviceBuilder::new(usb_bus_ref, UsbVidPid(0x16c0, 0x27dd))
            .manufacturer("railcommand")
            .product(STATION_NAME)
            .serial_number("0")
            .device_class(usbd_serial::USB_CLASS_CDC)
            .build();

        let dispatcher = Dispatcher {
            main_track,
            prog_track,
            prog_sense: ProgSense,
            main_power: PowerSupervisor::new(cfg.main.trigger_ma, cfg.main.current_conversion_factor),
            prog_power: PowerSupervisor::new(cfg.prog.trigger_ma, cfg.prog.current_conversion_factor),
            registries: InMemoryRegistries::new(),
            store: NullStore,
            identity: Identity { name: STATION_NAME, version: VERSION },
        };

        println!("railcommand up");

        (
            Shared {
                dispatcher,
                main_enable,
                prog_enable,
                usb_dev,
                usb_serial,
            },
            Local {
                main_pins,
                prog_pins,
                main_waveform,
                prog_waveform,
                bit_timer,
                power_timer,
                millis_timer,
                cmd_uart,
                cmd_line: String::new(),
                flash,
            },
            init::Monotonics(),
        )
    }

    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            cortex_m::asm::wfi();
        }
    }

    /// Bit-clock ISR: one half-bit per call, for both tracks in lockstep.
    /// Real installations run two independent track outputs off the same
    /// NMRA bit timing, so sharing one timer is the idiomatic simplification
    /// (the original hardware design runs them off one oscillator too).
    #[task(binds = TIM2, shared = [dispatcher], local = [main_pins, prog_pins, main_waveform, prog_waveform, bit_timer], priority = 15)]
    fn bit_clock(mut cx: bit_clock::Context) {
        cx.local.bit_timer.clear_interrupt(TimerInterrupt::Update);

        cx.shared.dispatcher.lock(|d| {
            if let crate::waveform::TickEvent::Toggle(level) =
                cx.local.main_waveform.tick(&mut d.main_track.engine)
            {
                cx.local.main_pins.drive(d.main_track.hardware().control_scheme, level);
            }
            if let crate::waveform::TickEvent::Toggle(level) =
                cx.local.prog_waveform.tick(&mut d.prog_track.engine)
            {
                cx.local.prog_pins.drive(d.prog_track.hardware().control_scheme, level);
            }
        });
    }

    /// Overcurrent supervisor tick, ~1kHz, one track per half-tick.
    #[task(binds = TIM3, shared = [dispatcher, main_enable, prog_enable], local = [power_timer], priority = 10)]
    fn power_tick(cx: power_tick::Context) {
        cx.local.power_timer.clear_interrupt(TimerInterrupt::Update);

        let main_sample = read_current(0);
        let prog_sample = read_current(1);
        let clock = MillisClock;

        let power_tick::SharedResources { mut dispatcher, mut main_enable, mut prog_enable, .. } = cx.shared;

        let (main_action, prog_action) = dispatcher.lock(|d| {
            (
                d.main_power.tick(main_sample, &clock),
                d.prog_power.tick(prog_sample, &clock),
            )
        });
        main_enable.lock(|pin| apply_enable_action(pin, main_action));
        prog_enable.lock(|pin| apply_enable_action(pin, prog_action));
    }

    fn apply_enable_action(pin: &mut Pin, action: EnableAction) {
        match action {
            EnableAction::Hold => {}
            EnableAction::Assert => pin.set_high(),
            EnableAction::Deassert => pin.set_low(),
        }
    }

    #[task(binds = TIM4, local = [millis_timer], priority = 1)]
    fn millis_tick(cx: millis_tick::Context) {
        cx.local.millis_timer.clear_interrupt(TimerInterrupt::Update);
        clock::tick();
    }

    /// Accumulates bytes from the command UART into a line buffer, and
    /// dispatches once a newline closes the `<...>`-framed command. Framing
    /// (the `<`/`>` brackets) is stripped here; only the inside reaches
    /// [`Dispatcher::dispatch`].
    #[task(binds = USART2, shared = [dispatcher, usb_serial, main_enable, prog_enable], local = [cmd_uart, cmd_line], priority = 5)]
    fn cmd_rx(mut cx: cmd_rx::Context) {
        let mut byte = [0u8; 1];
        if cx.local.cmd_uart.read(&mut byte).is_err() {
            return;
        }

        match byte[0] {
            b'<' => cx.local.cmd_line.clear(),
            b'>' => {
                let line = cx.local.cmd_line.clone();
                cx.local.cmd_line.clear();

                let uart = cx.local.cmd_uart;
                let (main_action, prog_action) = cx.shared.usb_serial.lock(|usb_serial| {
                    cx.shared.dispatcher.lock(|dispatcher| {
                        let mut printer = Printer::new();
                        let mut uart_transport = UsartTransport(uart);
                        let mut usb_transport = UsbTransport { serial: usb_serial };
                        printer.register(&mut uart_transport);
                        printer.register(&mut usb_transport);
                        dispatcher.dispatch(line.as_str(), &mut printer)
                    })
                });
                cx.shared.main_enable.lock(|pin| apply_enable_action(pin, main_action));
                cx.shared.prog_enable.lock(|pin| apply_enable_action(pin, prog_action));
            }
            b => {
                let _ = cx.local.cmd_line.push(b as char);
            }
        }
    }

    #[task(binds = OTG_FS, shared = [usb_dev, usb_serial], priority = 5)]
    fn usb_poll(cx: usb_poll::Context) {
        (cx.shared.usb_dev, cx.shared.usb_serial).lock(|usb_dev, usb_serial| {
            usb_dev.poll(&mut [usb_serial]);
        });
    }
}

#[cfg(test)]
fn main() {}
