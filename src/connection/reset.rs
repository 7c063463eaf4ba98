//! DTR/RTS sequences that drive the target into ROM download mode.
//!
//! DTR is routed to GPIO0 and RTS to EN through the auto-program transistor
//! pair found on most dev boards. USB-UART bridges disagree about the
//! polarity of both lines, so entry is attempted with a whole sequence of
//! strategies rather than a single configured one; each attempt is validated
//! by the sync engine before the next strategy is tried.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Result, interface::Interface};

/// How long EN is held low while the chip is in reset.
const RESET_HOLD: Duration = Duration::from_millis(100);
/// How long GPIO0 is kept asserted after reset is released.
const BOOT_HOLD: Duration = Duration::from_millis(50);
/// Settle time after the lines are released.
const RELEASE_SETTLE: Duration = Duration::from_millis(200);

/// A DTR/RTS timing sequence that tries to leave the target in download mode.
pub trait ResetStrategy {
    fn name(&self) -> &'static str;

    fn reset(&self, interface: &mut dyn Interface) -> Result<()>;

    fn set_dtr(&self, interface: &mut dyn Interface, level: bool) -> Result<()> {
        interface.set_dtr(level)
    }

    fn set_rts(&self, interface: &mut dyn Interface, level: bool) -> Result<()> {
        interface.set_rts(level)
    }
}

/// Reference sequence for bridges with direct line polarity.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset;

impl ResetStrategy for ClassicReset {
    fn name(&self) -> &'static str {
        "classic"
    }

    fn reset(&self, interface: &mut dyn Interface) -> Result<()> {
        debug!("Using classic reset sequence");

        self.set_dtr(interface, true)?; // IO0 = LOW
        self.set_rts(interface, false)?; // EN = HIGH
        sleep(Duration::from_millis(10));

        self.set_rts(interface, true)?; // EN = LOW, chip in reset
        sleep(RESET_HOLD);

        self.set_rts(interface, false)?; // EN = HIGH, chip out of reset
        sleep(BOOT_HOLD);

        self.set_dtr(interface, false)?; // IO0 = HIGH, done
        interface.clear_input_buffer()?;
        interface.clear_output_buffer()?;
        sleep(RELEASE_SETTLE);

        Ok(())
    }
}

/// The classic sequence with both line values negated, for bridges that
/// invert DTR and RTS.
#[derive(Debug, Clone, Copy)]
pub struct InvertedReset;

impl ResetStrategy for InvertedReset {
    fn name(&self) -> &'static str {
        "inverted"
    }

    fn reset(&self, interface: &mut dyn Interface) -> Result<()> {
        debug!("Using inverted reset sequence");

        self.set_dtr(interface, false)?; // IO0 = LOW
        self.set_rts(interface, true)?; // EN = HIGH
        sleep(Duration::from_millis(10));

        self.set_rts(interface, false)?; // EN = LOW, chip in reset
        sleep(RESET_HOLD);

        self.set_rts(interface, true)?; // EN = HIGH, chip out of reset
        sleep(BOOT_HOLD);

        self.set_dtr(interface, true)?; // IO0 = HIGH, done
        interface.clear_input_buffer()?;
        interface.clear_output_buffer()?;
        sleep(RELEASE_SETTLE);

        Ok(())
    }
}

/// Slow staggered sequence; helps with boards whose RC on EN makes the fast
/// sequences miss the boot-pin sampling window.
#[derive(Debug, Clone, Copy)]
pub struct StaggeredReset;

impl ResetStrategy for StaggeredReset {
    fn name(&self) -> &'static str {
        "staggered"
    }

    fn reset(&self, interface: &mut dyn Interface) -> Result<()> {
        debug!("Using staggered reset sequence");

        self.set_dtr(interface, false)?; // IO0 = HIGH
        self.set_rts(interface, false)?; // EN = HIGH
        sleep(Duration::from_millis(100));

        self.set_dtr(interface, true)?; // IO0 = LOW
        sleep(Duration::from_millis(100));

        self.set_rts(interface, true)?; // EN = LOW
        sleep(Duration::from_millis(100));

        self.set_rts(interface, false)?; // EN = HIGH
        sleep(Duration::from_millis(250));

        self.set_dtr(interface, false)?; // IO0 = HIGH
        sleep(Duration::from_millis(250));

        Ok(())
    }
}

/// Last-resort sequence: hold both lines, release reset slowly, then pulse
/// GPIO0 once more.
#[derive(Debug, Clone, Copy)]
pub struct AggressiveReset;

impl ResetStrategy for AggressiveReset {
    fn name(&self) -> &'static str {
        "aggressive"
    }

    fn reset(&self, interface: &mut dyn Interface) -> Result<()> {
        debug!("Using aggressive reset sequence");

        interface.clear_input_buffer()?;
        interface.clear_output_buffer()?;

        self.set_dtr(interface, true)?; // IO0 = LOW
        self.set_rts(interface, true)?; // EN = LOW
        sleep(Duration::from_millis(200));

        self.set_rts(interface, false)?; // EN = HIGH
        sleep(Duration::from_millis(300));

        self.set_dtr(interface, false)?; // IO0 = HIGH
        sleep(Duration::from_millis(100));

        self.set_dtr(interface, true)?; // IO0 = LOW again
        sleep(Duration::from_millis(50));
        self.set_dtr(interface, false)?; // IO0 = HIGH
        sleep(RELEASE_SETTLE);

        Ok(())
    }
}

/// The strategies to attempt, in order. Polarity is discovered by trying
/// them, not configured.
pub fn reset_strategy_sequence() -> Vec<Box<dyn ResetStrategy>> {
    vec![
        Box::new(ClassicReset),
        Box::new(InvertedReset),
        Box::new(StaggeredReset),
        Box::new(AggressiveReset),
    ]
}

/// One short reset pulse used to settle a target stuck in a reboot loop.
pub fn stabilization_pulse(interface: &mut dyn Interface) -> Result<()> {
    interface.set_rts(true)?; // EN = LOW
    sleep(Duration::from_millis(50));
    interface.set_rts(false)?; // EN = HIGH
    sleep(Duration::from_millis(100));
    Ok(())
}

/// Reset the target into its application (normal boot, GPIO0 released).
pub fn hard_reset(interface: &mut dyn Interface) -> Result<()> {
    interface.set_dtr(false)?; // IO0 = HIGH
    interface.set_rts(true)?; // EN = LOW
    sleep(Duration::from_millis(100));
    interface.set_rts(false)?; // EN = HIGH, boots the application

    Ok(())
}
