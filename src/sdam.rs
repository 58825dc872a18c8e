//! The client's view of the deployment: server and topology descriptions fed by the external
//! monitor, and server selection against them.

mod description;
#[cfg(test)]
mod test;
mod topology;

pub use self::description::{ServerDescription, ServerType, TopologyType, TopologyVersion};
pub(crate) use self::{
    description::{update_command_with_read_pref, TopologyDescription},
    topology::{SelectedServer, Server, Topology},
};
