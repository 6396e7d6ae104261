//! Node addresses on the spectrometer's OPC UA server.
//!
//! Defaults match the iC IR OPC UA server for the first probe. Methods are
//! always invoked on the `methods` container object.

use serde::{Deserialize, Serialize};

const PROBE: &str = "ns=2;s=Local.iCIR.Probe1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMap {
    /// Parent object all methods are called on
    pub methods: String,
    pub start_experiment: String,
    pub pause: String,
    pub resume: String,
    pub stop: String,
    pub set_sampling_interval: String,
    pub raw_spectra: String,
    pub treated_spectra: String,
    pub background_spectra: String,
    pub current_sampling_interval: String,
}

impl NodeMap {
    /// Node map for the probe rooted at `probe` (e.g. `ns=2;s=Local.iCIR.Probe2`)
    pub fn for_probe(probe: &str) -> Self {
        Self {
            methods: format!("{probe}.Methods"),
            start_experiment: format!("{probe}.Methods.Start Experiment"),
            pause: format!("{probe}.Methods.Pause"),
            resume: format!("{probe}.Methods.Resume"),
            stop: format!("{probe}.Methods.Stop"),
            set_sampling_interval: format!("{probe}.Methods.SetSamplingInterval"),
            raw_spectra: format!("{probe}.SpectraRaw"),
            treated_spectra: format!("{probe}.SpectraTreated"),
            background_spectra: format!("{probe}.SpectraBackground"),
            current_sampling_interval: format!("{probe}.CurrentSamplingInterval"),
        }
    }
}

impl Default for NodeMap {
    fn default() -> Self {
        Self::for_probe(PROBE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_addresses() {
        let nodes = NodeMap::default();
        assert_eq!(nodes.methods, "ns=2;s=Local.iCIR.Probe1.Methods");
        assert_eq!(
            nodes.start_experiment,
            "ns=2;s=Local.iCIR.Probe1.Methods.Start Experiment"
        );
        assert_eq!(nodes.raw_spectra, "ns=2;s=Local.iCIR.Probe1.SpectraRaw");
    }
}
