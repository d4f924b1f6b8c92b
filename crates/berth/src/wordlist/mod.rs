//! Word lists for human-readable session slugs.
//! Format: adjective-adjective-noun (e.g., "brave-quiet-otter")

use rand::Rng;

/// Adjectives for slug generation.
const ADJECTIVES: &[&str] = &[
    "able", "agile", "amber", "ample", "azure", "bold", "brave", "brief", "bright", "brisk",
    "calm", "candid", "cheery", "civil", "clean", "clever", "cosmic", "cozy", "crisp", "curious",
    "daring", "dapper", "deft", "eager", "early", "earnest", "easy", "epic", "fair", "fancy",
    "fast", "fine", "firm", "fleet", "fluffy", "fond", "frank", "free", "fresh", "gentle",
    "giddy", "glad", "golden", "grand", "happy", "hardy", "hearty", "honest", "humble", "jolly",
    "keen", "kind", "lively", "loyal", "lucid", "lucky", "mellow", "merry", "mighty", "mild",
    "modest", "neat", "nimble", "noble", "odd", "plucky", "polite", "proud", "quick", "quiet",
    "rapid", "ready", "rosy", "royal", "rustic", "sharp", "shiny", "silent", "sleek", "smart",
    "snappy", "snug", "solid", "spry", "steady", "stout", "sunny", "swift", "tidy", "tiny",
    "upbeat", "vivid", "warm", "wary", "wise", "witty", "young", "zany", "zesty", "zippy",
];

/// Nouns for slug generation.
const NOUNS: &[&str] = &[
    "badger", "beaver", "bison", "bobcat", "canary", "caribou", "cheetah", "condor", "corgi",
    "coyote", "crane", "cricket", "dingo", "dolphin", "donkey", "eagle", "egret", "falcon",
    "ferret", "finch", "fox", "gazelle", "gecko", "gibbon", "gopher", "heron", "hornet", "ibis",
    "iguana", "impala", "jackal", "jaguar", "kestrel", "koala", "lemur", "leopard", "lion",
    "llama", "lynx", "magpie", "mantis", "marmot", "marten", "meerkat", "mink", "moose",
    "narwhal", "newt", "ocelot", "okapi", "orca", "osprey", "otter", "owl", "panda", "panther",
    "parrot", "pelican", "penguin", "pigeon", "puffin", "puma", "quail", "rabbit", "raccoon",
    "raven", "robin", "salmon", "seal", "shrew", "skunk", "sparrow", "squid", "stoat", "stork",
    "swan", "tapir", "tiger", "toucan", "trout", "turtle", "viper", "vole", "walrus", "weasel",
    "whale", "wombat", "wren", "yak", "zebra",
];

/// Generate a random slug such as `brave-quiet-otter`.
///
/// The two adjectives are always distinct.
pub fn generate_slug() -> String {
    let mut rng = rand::rng();
    let first = rng.random_range(0..ADJECTIVES.len());
    let mut second = rng.random_range(0..ADJECTIVES.len() - 1);
    if second >= first {
        second += 1;
    }
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    format!("{}-{}-{}", ADJECTIVES[first], ADJECTIVES[second], noun)
}

/// Check that a string has the slug shape produced by [`generate_slug`].
pub fn is_valid_slug(slug: &str) -> bool {
    let parts: Vec<&str> = slug.split('-').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_lowercase()))
}
