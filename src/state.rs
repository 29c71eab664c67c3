//! Control-channel test states.
//!
//! A state travels on the control socket as one signed byte. The main
//! sequence runs from [`TestState::IperfStart`] to [`TestState::IperfDone`];
//! the negative values and the two terminate states are side branches that
//! end a test early.

use crate::error::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum TestState {
    TestStart = 1,
    TestRunning = 2,
    TestEnd = 4,
    ParamExchange = 9,
    CreateStreams = 10,
    ServerTerminate = 11,
    ClientTerminate = 12,
    ExchangeResults = 13,
    DisplayResults = 14,
    IperfStart = 15,
    IperfDone = 16,
    AccessDenied = -1,
    ServerError = -2,
}

/// The only ordering the main sequence may follow.
const MAIN_SEQUENCE: [TestState; 9] = [
    TestState::IperfStart,
    TestState::ParamExchange,
    TestState::CreateStreams,
    TestState::TestStart,
    TestState::TestRunning,
    TestState::TestEnd,
    TestState::ExchangeResults,
    TestState::DisplayResults,
    TestState::IperfDone,
];

impl TestState {
    /// Decodes a state byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownState`] for any value outside the enumeration.
    pub fn from_wire(byte: i8) -> Result<Self> {
        Ok(match byte {
            1 => TestState::TestStart,
            2 => TestState::TestRunning,
            4 => TestState::TestEnd,
            9 => TestState::ParamExchange,
            10 => TestState::CreateStreams,
            11 => TestState::ServerTerminate,
            12 => TestState::ClientTerminate,
            13 => TestState::ExchangeResults,
            14 => TestState::DisplayResults,
            15 => TestState::IperfStart,
            16 => TestState::IperfDone,
            -1 => TestState::AccessDenied,
            -2 => TestState::ServerError,
            other => return Err(Error::UnknownState(other)),
        })
    }

    pub fn to_wire(self) -> i8 {
        self as i8
    }

    /// Position in the main sequence, `None` for side branches.
    pub fn rank(self) -> Option<usize> {
        MAIN_SEQUENCE.iter().position(|s| *s == self)
    }

    /// Terminal states end the test; only a reset leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TestState::IperfDone
                | TestState::AccessDenied
                | TestState::ServerError
                | TestState::ClientTerminate
                | TestState::ServerTerminate
        )
    }

    /// True when the state is one of the early-exit branches.
    pub fn is_side_branch(self) -> bool {
        self.rank().is_none()
    }

    /// Terminal states are padded to four bytes on the wire so a peer
    /// blocked on a frame length is released.
    pub fn needs_padding(self) -> bool {
        matches!(self, TestState::IperfDone | TestState::ClientTerminate)
    }

    /// Whether `next` may follow `self` within one test run.
    ///
    /// The main sequence advances one step at a time; a side branch may be
    /// taken from any non-terminal state.
    pub fn can_advance_to(self, next: TestState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_side_branch() {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to == from + 1,
            _ => false,
        }
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestState::TestStart => "TEST_START",
            TestState::TestRunning => "TEST_RUNNING",
            TestState::TestEnd => "TEST_END",
            TestState::ParamExchange => "PARAM_EXCHANGE",
            TestState::CreateStreams => "CREATE_STREAMS",
            TestState::ServerTerminate => "SERVER_TERMINATE",
            TestState::ClientTerminate => "CLIENT_TERMINATE",
            TestState::ExchangeResults => "EXCHANGE_RESULTS",
            TestState::DisplayResults => "DISPLAY_RESULTS",
            TestState::IperfStart => "IPERF_START",
            TestState::IperfDone => "IPERF_DONE",
            TestState::AccessDenied => "ACCESS_DENIED",
            TestState::ServerError => "SERVER_ERROR",
        };
        f.write_str(name)
    }
}
