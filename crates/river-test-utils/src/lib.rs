// river-test-utils: Shared test utilities for the River client suites.
//
// Provides a mock River server speaking the server side of the v2.0
// protocol for integration testing of the client core.

pub mod mock_server;

pub use mock_server::{HandshakeReject, MockRiverServer, MockServerOptions};
