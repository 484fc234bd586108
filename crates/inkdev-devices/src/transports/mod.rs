/*!
 * Transport implementations.
 *
 * Each transport provides a [`Connector`](crate::link::Connector) that opens
 * links and a [`DiscoverySource`](crate::watcher::DiscoverySource) that finds
 * devices. Radio stacks plug in here; the simulated transport runs entirely
 * in process and backs the demos and tests.
 */

pub mod sim;

pub use sim::{SimController, SimDiscoveryHandle, SimulatedConnector, SimulatedDevice, SimulatedDiscovery};
