//! Client secrets
//!
//! Short-lived diceware passphrases handed to clients between plugin
//! authentication and unit selection. Five words from a 128-word list give
//! 35 bits of entropy, plenty for a secret that expires after five
//! minutes and travels over the control channel only.

use subtle::ConstantTimeEq;

/// Words per generated secret.
pub const SECRET_WORDS: usize = 5;

const WORDLIST: [&str; 128] = [
    "acid", "acorn", "alloy", "amber", "anchor", "anvil", "apron", "arrow", "atlas", "auburn",
    "badge", "bagel", "basil", "baton", "beacon", "bellow", "birch", "bison", "blaze", "bluff",
    "bolt", "bramble", "brine", "bronze", "bugle", "cabin", "cactus", "camber", "canyon", "cedar",
    "chalk", "cider", "cinder", "clover", "cobalt", "comet", "copper", "coral", "cotton", "crag",
    "crane", "crest", "crocus", "dagger", "delta", "drift", "dusk", "eagle", "ember", "fable",
    "falcon", "fennel", "fern", "fjord", "flint", "forge", "fossil", "gale", "garnet", "geyser",
    "glade", "glint", "gorge", "granite", "grove", "gulch", "harbor", "hazel", "heron", "hollow",
    "ingot", "ivory", "jasper", "juniper", "kelp", "kiln", "knoll", "lagoon", "lantern", "larch",
    "lava", "ledge", "lichen", "linden", "lunar", "mango", "maple", "marsh", "mesa", "mica",
    "morrow", "moss", "nectar", "nimbus", "oasis", "ochre", "onyx", "opal", "osprey", "otter",
    "pebble", "pine", "plume", "prairie", "quartz", "quill", "raven", "reef", "ridge", "russet",
    "saffron", "sage", "shale", "sierra", "slate", "sorrel", "spruce", "summit", "tarn", "thistle",
    "timber", "tundra", "umber", "vale", "walnut", "willow", "wren", "zephyr",
];

/// Generate a hyphen-joined diceware secret, e.g. `cedar-bolt-mesa-fern-opal`.
pub fn generate_secret() -> String {
    let mut words = Vec::with_capacity(SECRET_WORDS);
    for _ in 0..SECRET_WORDS {
        words.push(WORDLIST[fastrand::usize(..WORDLIST.len())]);
    }
    words.join("-")
}

/// Constant-time secret comparison.
pub fn secrets_match(candidate: &str, expected: &str) -> bool {
    candidate.as_bytes().ct_eq(expected.as_bytes()).into()
}
