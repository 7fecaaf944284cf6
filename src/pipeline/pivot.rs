//! Pivot strategies
//!
//! The vendor service this pipeline depends on is adversarial to change, so
//! a terminal failure must end with advice rather than a bare error: a static
//! table maps (stage, reason code) to a ranked list of fallback strategies,
//! recorded on the run for a human or an alternate adapter to act on.

use super::run::Stage;

/// Ranked fallback strategies for a terminal failure
///
/// The first entry is the recommended next move. Combinations the table does
/// not know get a generic inspection strategy rather than an empty list.
pub fn strategies(stage: Stage, code: &str) -> &'static [&'static str] {
    match (stage, code) {
        (Stage::ParsingLicense, "U1001" | "U1002") => &[
            "inspect the descriptor against the vendor schema for drift",
            "request a fresh license descriptor from the vendor",
        ],
        (Stage::ParsingLicense, "U1003") => &[
            "request a fresh license descriptor from the vendor",
            "check the local clock before concluding the loan lapsed",
        ],
        (Stage::Fulfilling, "U2001") => &[
            "check connectivity to the fulfillment endpoint",
            "retry later; the server may be rate-limiting this device",
            "switch to the alternate fulfillment endpoint",
        ],
        (Stage::Fulfilling, "U2002") => &[
            "re-authorize the device with the vendor",
            "switch to the alternate fulfillment endpoint",
        ],
        (Stage::Fulfilling, "U2003") => &[
            "compare the vendor error code against the provider's published list",
            "switch to the alternate fulfillment endpoint",
            "acquire the content through an alternate channel",
        ],
        (Stage::Fulfilling, "U7005") => &[
            "register the device key with the configured key store",
            "point the pipeline at the key store holding this device",
        ],
        (Stage::BuildingRights, "U3001") => &[
            "update the rights schema templates for the new namespace",
            "pin this vendor to a known schema version in configuration",
        ],
        (Stage::ConvertingKey, "U4001" | "U4002" | "U4003") => &[
            "re-export the device key from the vendor tooling",
            "re-register the device to mint a fresh key",
        ],
        (Stage::RepairingContainer, "U5001" | "U5002" | "U5003") => &[
            "re-download the container before repairing again",
            "inspect the archive with an external ZIP tool",
        ],
        (Stage::Decrypting, "U6001") => {
            &["file a stage-ordering bug; repair must precede decryption"]
        }
        (Stage::Decrypting, "U6002") => &[
            "re-derive the device key from an alternate source",
            "acquire the content through an alternate channel",
        ],
        (Stage::Decrypting, "U6003") => &[
            "re-download the container to rule out corruption in transit",
            "re-run fulfillment in case the content key rotated",
        ],
        (Stage::Decrypting, "U5001" | "U5002" | "U5003") => &[
            "re-run container repair before decrypting",
            "re-download the container before repairing again",
        ],
        (Stage::Decrypting, "U3001" | "U3002") => &[
            "re-run container repair to rewrite the rights record",
            "update the rights schema templates for the new namespace",
        ],
        _ => &["inspect the run's failure report and artifacts under the workdir"],
    }
}
