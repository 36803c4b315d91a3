#![cfg_attr(not(test), no_std)]
//! HTU31D driver for a printer host.
//!
//! The driver owns the device protocol and nothing else: the host hands it an I2C bus, a
//! cooperative delay, and a [`Host`] that knows the event loop clock, the print-time domain and
//! how to shut the machine down. The host also owns the sampling timer; every driver entry point
//! that affects scheduling returns the [`WakeTime`] the timer should be set to.
//!
//! Example:
//!
//! ```
//! use embedded_hal_mock::eh1::delay::NoopDelay;
//! use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction};
//! use htu31d_driver::{Command, Config, Host, WakeTime, HTU31D, SENSOR_ADDRESS};
//!
//! struct Reactor {
//!     now: f64,
//! }
//!
//! impl Host for Reactor {
//!     fn monotonic(&self) -> f64 {
//!         self.now
//!     }
//!     fn estimated_print_time(&self, eventtime: f64) -> f64 {
//!         eventtime - 1.5
//!     }
//!     fn invoke_shutdown(&mut self, message: core::fmt::Arguments<'_>) {
//!         panic!("{}", message);
//!     }
//! }
//!
//! let expectations = vec![
//!     // handle_connect: soft reset, then the 4 byte serial number.
//!     Transaction::write(SENSOR_ADDRESS, vec![Command::SoftReset as u8]),
//!     Transaction::write_read(
//!         SENSOR_ADDRESS,
//!         vec![Command::ReadSerial as u8],
//!         vec![0x12, 0x34, 0x56, 0x78],
//!     ),
//!     // sample: start a conversion, then fetch both channels.
//!     Transaction::write(SENSOR_ADDRESS, vec![Command::Conversion as u8]),
//!     Transaction::write(SENSOR_ADDRESS, vec![Command::ReadTempHum as u8]),
//!     Transaction::read(SENSOR_ADDRESS, vec![0x66, 0x66, 0x12, 0x80, 0x00, 0x23]),
//! ];
//! let mut delay = NoopDelay::new();
//! let mut reactor = Reactor { now: 100.0 };
//!
//! let mut htu31d = HTU31D::new(I2cMock::new(&expectations), Config::default(), |print_time, temperature| {
//!     println!("{:.3}: {:.2}C", print_time, temperature);
//! })
//! .unwrap();
//! htu31d.setup_minmax(0.0, 60.0);
//!
//! assert_eq!(htu31d.handle_connect(&mut delay).unwrap(), WakeTime::Now);
//! assert_eq!(htu31d.sample(&mut delay, &mut reactor), WakeTime::At(130.0));
//!
//! let status = htu31d.status();
//! println!("temperature (htu31d): {:.2}C", status.temperature);
//! println!("humidity (htu31d): {:.2}%", status.humidity);
//!
//! htu31d.destroy().done();
//! ```
//!
//! [HTU31D Datasheet](https://www.te.com/commerce/DocumentDelivery/DDEController?Action=showdoc&DocId=Data+Sheet%7FHTU31_RHT_SENSOR_IC%7F5%7Fpdf%7FEnglish%7FENG_DS_HTU31_RHT_SENSOR_IC_5.pdf)
//!
//! The below is how a connect event and the periodic sampling timer drive the sensor. Every
//! "Wait" is a cooperative delay: the host's `DelayNs` implementation is expected to yield to its
//! event loop rather than block it.
//!
//! ```text
//!            Connect event
//!                  │
//!                  ▼
//!   Command::SoftReset (0x1E)
//!                  │
//!                  ▼
//!              Wait 15 ms
//!                  │
//!                  ▼
//!   Command::ReadSerial (0x0A), read 4 bytes
//!                  │
//!                  ▼
//!          WakeTime::Now  ───────────────────────┐
//!                                                 │
//!   Command::Conversion (0x40)    ◄───────────────┤
//!                  │                              │
//!                  ▼                              │
//!              Wait 20 ms                         │
//!                  │                              │
//!                  ▼                              │
//!   Command::ReadTempHum (0x00), read 6 bytes     │
//!                  │                              │
//!       bus error ─┼──► zero readings, WakeTime::Never
//!                  ▼                              │
//!    CRC per channel, keep old value on mismatch  │
//!                  │                              │
//!                  ▼                              │
//!     Range check ─► out of range ─► shutdown     │
//!                  │                              │
//!                  ▼                              │
//!    callback(print_time, temperature)            │
//!                  │                              │
//!                  ▼                              │
//!     WakeTime::At(now + report_time) ────────────┘
//! ```

#[cfg(all(feature = "use-defmt", feature = "log"))]
compile_error!("Features \"use-defmt\" and \"log\" are mutually exclusive and cannot be enabled together");

use core::fmt;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{self, I2c};

#[cfg(feature = "use-defmt")]
use defmt::{debug, error, info, warn};
#[cfg(feature = "log")]
use log::{debug, error, info, warn};
#[cfg(not(any(feature = "use-defmt", feature = "log")))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(any(feature = "use-defmt", feature = "log")))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(any(feature = "use-defmt", feature = "log")))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(any(feature = "use-defmt", feature = "log")))]
macro_rules! error {
    ($($arg:tt)*) => {};
}

/// HTU31D sensor's default I2C address.
pub const SENSOR_ADDRESS: u8 = 0b0100_0000; // This is I2C address 0x40;

/// Default I2C bus speed in Hz.
pub const DEFAULT_SPEED: u32 = 100_000;

/// Default time between two samples, in seconds.
pub const DEFAULT_REPORT_TIME: u32 = 30;

/// Shortest accepted time between two samples, in seconds.
pub const MIN_REPORT_TIME: u32 = 5;

/// Sensor type name a host's sensor factory maps to this driver.
pub const SENSOR_TYPE: &str = "HTU31D";

// The sensor guarantees a soft reset completes within 15ms.
const RESET_DELAY_MS: u32 = 15;
// ADC settling time after a conversion command.
const CONVERSION_DELAY_MS: u32 = 20;

/// Commands that can be sent to the HTU31D sensor.
///
/// All commands are a single byte. None of them take parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReadTempHum = 0b0000_0000, // 0x00
    // Select the temperature and humidity result registers. The following plain read returns 6
    // bytes: temperature MSB, LSB, CRC, then humidity MSB, LSB, CRC.
    Conversion = 0b0100_0000, // 0x40
    // Start a temperature and humidity conversion at the default resolution. Results are ready
    // after CONVERSION_DELAY_MS.
    ReadSerial = 0b0000_1010, // 0x0A
    // Read back 4 bytes of serial number, most significant byte first.
    HeaterOn = 0b0000_0100,  // 0x04
    HeaterOff = 0b0000_0010, // 0x02
    SoftReset = 0b0001_1110, // 0x1E
    // Takes up to RESET_DELAY_MS to complete.
}

/// Does `sensor_type` name this driver?
///
/// Used by a host's sensor factory to pick the constructor for a configured sensor.
pub fn matches_sensor_type(sensor_type: &str) -> bool {
    sensor_type == SENSOR_TYPE
}

/// When the host should next run the sampling timer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WakeTime {
    /// As soon as possible.
    Now,
    /// At the given time on the host's monotonic clock, in seconds.
    At(f64),
    /// Never again. The timer is effectively deregistered.
    Never,
}

/// Services the driver borrows from the host for the duration of a sampling cycle.
pub trait Host {
    /// Current time on the event loop's monotonic clock, in seconds.
    fn monotonic(&self) -> f64;

    /// Translate a monotonic timestamp into the print-time domain used for reports.
    fn estimated_print_time(&self, eventtime: f64) -> f64;

    /// Request an unrecoverable shutdown of the whole machine.
    fn invoke_shutdown(&mut self, message: fmt::Arguments<'_>);
}

/// What to do once a bus error has aborted a sampling cycle.
///
/// The readings have already been zeroed when this is called. Returning [`WakeTime::Never`]
/// disables the driver until the next successful [`HTU31D::handle_connect`].
pub trait FaultPolicy {
    fn on_transport_fault(&mut self, eventtime: f64) -> WakeTime;
}

/// Stop sampling for good after the first bus error.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisableOnFault;

impl FaultPolicy for DisableOnFault {
    fn on_transport_fault(&mut self, _eventtime: f64) -> WakeTime {
        WakeTime::Never
    }
}

/// Driver configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// I2C address of the sensor.
    pub address: u8,
    /// I2C bus speed in Hz. The driver does not use this itself; it is for the host to set up
    /// the bus it hands over.
    pub speed: u32,
    /// Seconds between two samples. At least `MIN_REPORT_TIME`.
    pub report_time: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: SENSOR_ADDRESS,
            speed: DEFAULT_SPEED,
            report_time: DEFAULT_REPORT_TIME,
        }
    }
}

impl Config {
    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn with_speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_report_time(mut self, report_time: u32) -> Self {
        self.report_time = report_time;
        self
    }
}

/// Serial number read from the sensor during initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialNumber(pub u32);

impl SerialNumber {
    fn from_bytes(bytes: [u8; 4]) -> Self {
        SerialNumber(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// One unchecked frame of sensor data.
///
/// This is what the sensor sends back after `Command::ReadTempHum`: two 16 bit readings, each
/// followed by its own CRC byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub raw_temp: u16,
    pub temp_crc: u8,
    pub raw_hum: u16,
    pub hum_crc: u8,
}

impl RawSample {
    /// Split the 6 byte frame `[temp_hi, temp_lo, temp_crc, hum_hi, hum_lo, hum_crc]`.
    pub fn from_bytes(frame: [u8; 6]) -> Self {
        RawSample {
            raw_temp: u16::from_be_bytes([frame[0], frame[1]]),
            temp_crc: frame[2],
            raw_hum: u16::from_be_bytes([frame[3], frame[4]]),
            hum_crc: frame[5],
        }
    }

    pub fn temperature_crc_ok(&self) -> bool {
        compute_crc(self.raw_temp) == u32::from(self.temp_crc)
    }

    pub fn humidity_crc_ok(&self) -> bool {
        compute_crc(self.raw_hum) == u32::from(self.hum_crc)
    }

    /// Convert both channels, checked or not.
    pub fn calibrate(&self) -> CalibratedReading {
        CalibratedReading {
            temperature: raw_to_celsius(self.raw_temp),
            humidity: raw_to_relative_humidity(self.raw_hum),
        }
    }
}

/// A RawSample converted to physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibratedReading {
    /// Degrees Celsius.
    pub temperature: f64,
    /// % Relative Humidity.
    pub humidity: f64,
}

/// Convert a raw temperature reading to degrees Celsius.
pub fn raw_to_celsius(raw_temp: u16) -> f64 {
    f64::from(raw_temp) / 65535.0 * 165.0 - 40.0
}

/// Convert a raw humidity reading to % Relative Humidity.
pub fn raw_to_relative_humidity(raw_hum: u16) -> f64 {
    f64::from(raw_hum) / 65535.0 * 100.0
}

/// Snapshot returned by [`HTU31D::status`].
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Status {
    /// Degrees Celsius, rounded to two decimals.
    pub temperature: f64,
    /// % Relative Humidity, as last read.
    pub humidity: f64,
}

/// Round half away from zero to two decimals.
fn round2(value: f64) -> f64 {
    let scaled = value * 100.0;
    let rounded = if scaled >= 0.0 {
        (scaled + 0.5) as i64
    } else {
        (scaled - 0.5) as i64
    };
    rounded as f64 / 100.0
}

#[derive(Debug, Default, Clone, Copy)]
struct SensorState {
    temperature: f64,
    humidity: f64,
    min_temp: f64,
    max_temp: f64,
}

/// Driver errors.
#[derive(Debug, PartialEq)]
pub enum Error<E> {
    /// I2C bus error
    I2c(E),
    /// The report time is below `MIN_REPORT_TIME`
    InvalidReportTime(u32),
}

#[cfg_attr(not(any(feature = "use-defmt", feature = "log")), allow(dead_code))]
fn describe_error<E: i2c::Error>(err: &Error<E>) -> &'static str {
    match err {
        Error::I2c(e) => match e.kind() {
            i2c::ErrorKind::Bus => "bus error",
            i2c::ErrorKind::ArbitrationLoss => "arbitration loss",
            i2c::ErrorKind::NoAcknowledge(_) => "no acknowledge",
            i2c::ErrorKind::Overrun => "overrun",
            _ => "other bus error",
        },
        Error::InvalidReportTime(_) => "invalid report time",
    }
}

/// An HTU31D sensor on the I2C bus `I`, reporting through `F`.
///
/// `F` receives `(print_time, temperature)` after every completed sampling cycle. `P` decides
/// what happens after a bus error; by default sampling stops for good.
pub struct HTU31D<I, F, P = DisableOnFault> {
    i2c: I,
    address: u8,
    report_time: u32,
    state: SensorState,
    callback: F,
    fault_policy: P,
    disabled: bool,
}

impl<E, I, F> HTU31D<I, F, DisableOnFault>
where
    I: I2c<Error = E>,
    F: FnMut(f64, f64),
{
    /// Create the HTU31D driver.
    ///
    /// This consumes the I2C bus `I`. Nothing is sent to the sensor until `handle_connect` is
    /// called. Readings are zero until the first successful sample.
    pub fn new(i2c: I, config: Config, callback: F) -> Result<Self, Error<E>> {
        if config.report_time < MIN_REPORT_TIME {
            return Err(Error::InvalidReportTime(config.report_time));
        }

        Ok(HTU31D {
            i2c,
            address: config.address,
            report_time: config.report_time,
            state: SensorState::default(),
            callback,
            fault_policy: DisableOnFault,
            disabled: false,
        })
    }
}

impl<E, I, F, P> HTU31D<I, F, P>
where
    E: i2c::Error,
    I: I2c<Error = E>,
    F: FnMut(f64, f64),
    P: FaultPolicy,
{
    /// Replace the policy applied when a bus error aborts a sampling cycle.
    pub fn with_fault_policy<Q: FaultPolicy>(self, fault_policy: Q) -> HTU31D<I, F, Q> {
        HTU31D {
            i2c: self.i2c,
            address: self.address,
            report_time: self.report_time,
            state: self.state,
            callback: self.callback,
            fault_policy,
            disabled: self.disabled,
        }
    }

    /// Set the temperature range outside of which the machine is shut down.
    ///
    /// `min_temp <= max_temp` is expected and not checked.
    pub fn setup_minmax(&mut self, min_temp: f64, max_temp: f64) {
        self.state.min_temp = min_temp;
        self.state.max_temp = max_temp;
    }

    /// Seconds between two samples.
    pub fn report_time_delta(&self) -> u32 {
        self.report_time
    }

    /// Has a bus error stopped sampling?
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Handle the host's connect event.
    ///
    /// Runs `init` and, if the sensor answered, returns `WakeTime::Now` for the host to schedule
    /// the first sample. A bus error is returned as is: the sensor is unusable and the host
    /// should treat it as a failed connect. This also re-enables a driver that a previous bus
    /// error had disabled.
    pub fn handle_connect(&mut self, delay: &mut impl DelayNs) -> Result<WakeTime, Error<E>> {
        self.init(delay)?;
        self.disabled = false;
        Ok(WakeTime::Now)
    }

    /// Reset the sensor and read its serial number.
    ///
    /// This takes *at least* 15ms. A serial number of 0 is logged but not an error, the sensor
    /// may still work.
    pub fn init(&mut self, delay: &mut impl DelayNs) -> Result<SerialNumber, Error<E>> {
        self.send_command(Command::SoftReset)?;
        delay.delay_ms(RESET_DELAY_MS);

        let serial = self.read_serial()?;
        if serial.0 == 0 {
            warn!("htu31d: serial is 0");
        }
        info!("htu31d: initialized, serial {}", serial.0);

        Ok(serial)
    }

    /// Ask for the serial number and read the 4 bytes back with a repeated start.
    fn read_serial(&mut self) -> Result<SerialNumber, Error<E>> {
        let command: [u8; 1] = [Command::ReadSerial as u8];
        let mut read_buffer = [0u8; 4];

        self.i2c
            .write_read(self.address, &command, &mut read_buffer)
            .map_err(Error::I2c)?;

        Ok(SerialNumber::from_bytes(read_buffer))
    }

    /// Run one sampling cycle. This is the host's timer callback.
    ///
    /// Takes at least 20ms. Each channel is only updated when its CRC matches; a mismatch keeps
    /// the previous value and is logged. After the update the temperature is range checked, then
    /// reported to the callback in print time. The return value is when to run the next cycle.
    ///
    /// A bus error anywhere in the cycle zeroes both readings and skips the range check and the
    /// report. The fault policy then picks the next wake time.
    pub fn sample(&mut self, delay: &mut impl DelayNs, host: &mut impl Host) -> WakeTime {
        if self.disabled {
            return WakeTime::Never;
        }

        let raw = match self.read_raw_sample(delay) {
            Ok(raw) => raw,
            Err(err) => {
                error!("htu31d: Error reading data: {}", describe_error(&err));
                self.state.temperature = 0.0;
                self.state.humidity = 0.0;
                let wake = self.fault_policy.on_transport_fault(host.monotonic());
                self.disabled = wake == WakeTime::Never;
                return wake;
            }
        };

        self.apply(&raw);
        self.check_range(host);

        let measured_time = host.monotonic();
        let print_time = host.estimated_print_time(measured_time);
        (self.callback)(print_time, self.state.temperature);

        WakeTime::At(measured_time + f64::from(self.report_time))
    }

    /// Trigger a conversion, wait for it, and read the 6 byte result frame.
    fn read_raw_sample(&mut self, delay: &mut impl DelayNs) -> Result<RawSample, Error<E>> {
        self.send_command(Command::Conversion)?;
        delay.delay_ms(CONVERSION_DELAY_MS);

        self.send_command(Command::ReadTempHum)?;
        let mut read_buffer = [0u8; 6];
        self.i2c
            .read(self.address, &mut read_buffer)
            .map_err(Error::I2c)?;

        Ok(RawSample::from_bytes(read_buffer))
    }

    /// Store the channels of `raw` whose CRC matches.
    fn apply(&mut self, raw: &RawSample) {
        let reading = raw.calibrate();

        if raw.temperature_crc_ok() {
            self.state.temperature = reading.temperature;
            debug!("htu31d: Temperature {}", self.state.temperature);
        } else {
            warn!("htu31d: Checksum error on Temperature reading!");
        }

        if raw.humidity_crc_ok() {
            self.state.humidity = reading.humidity;
            debug!("htu31d: Humidity {}", self.state.humidity);
        } else {
            warn!("htu31d: Checksum error on Humidity reading!");
        }
    }

    fn check_range(&self, host: &mut impl Host) {
        let SensorState {
            temperature,
            min_temp,
            max_temp,
            ..
        } = self.state;

        if temperature < min_temp || temperature > max_temp {
            host.invoke_shutdown(format_args!(
                "HTU31D temperature {:.1} outside range of {:.1}:{:.1}",
                temperature, min_temp, max_temp
            ));
        }
    }

    /// Latest readings. Zeros before the first successful sample and after a bus error.
    pub fn status(&self) -> Status {
        Status {
            temperature: round2(self.state.temperature),
            humidity: self.state.humidity,
        }
    }

    /// Switch the on-chip heater used to drive off condensation.
    ///
    /// The heater skews temperature readings while it is on.
    pub fn set_heater(&mut self, enabled: bool) -> Result<(), Error<E>> {
        let command = if enabled {
            Command::HeaterOn
        } else {
            Command::HeaterOff
        };
        self.send_command(command)
    }

    fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        let command: [u8; 1] = [command as u8];
        self.i2c.write(self.address, &command).map_err(Error::I2c)
    }

    /// Destroys this driver and releases the I2C bus `I`
    pub fn destroy(self) -> I {
        self.i2c
    }
}

/// compute_crc reproduces the sensor's CRC over one 16 bit reading.
///
/// The datasheet describes the checksum as CRC-8 with the polynomial `x**8 + x**5 + x**4 + 1`
/// (`0x131`, or `0x31` with the top bit left out) and no initial value. The reading is shifted
/// up by 8 to make room for the remainder, then divided bit by bit: the polynomial is lined up
/// under the highest bit still in play (`0x131 << 15 == 0x988000`), XORed in whenever that bit
/// is set, and walked one position right each round until only the low 8 bits remain.
///
/// The whole 24 bit register is returned rather than its low byte. Every round clears the bit
/// it looked at, so after 16 rounds nothing above bit 7 is left and the value compares directly
/// against the transmitted CRC byte.
pub fn compute_crc(value: u16) -> u32 {
    let mut polynom: u32 = 0x98_8000;
    let mut msb: u32 = 0x80_0000;
    let mut mask: u32 = 0xFF_8000;
    let mut result: u32 = u32::from(value) << 8;

    while msb != 0x80 {
        if result & msb != 0 {
            result = ((result ^ polynom) & mask) | (result & !mask);
        }

        msb >>= 1;
        mask >>= 1;
        polynom >>= 1;
    }

    result
}
