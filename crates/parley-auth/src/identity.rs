use rand::Rng;

/// Supplies the identity a session requests tokens for.
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedIdentity(pub String);

impl FixedIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }
}

impl IdentityProvider for FixedIdentity {
    fn identity(&self) -> String {
        self.0.clone()
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "daring", "eager", "fuzzy", "gentle", "hazy", "idle", "jolly",
    "keen", "lucky", "mellow", "nimble", "quiet", "rapid", "sunny", "tidy", "vivid", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "crane", "dingo", "egret", "ferret", "gecko", "heron", "ibex", "koala", "lemur",
    "marten", "newt", "otter", "puffin", "quail", "raven", "stoat", "tapir", "vole", "wombat",
];

/// Anonymous identity of the form `adjective-animal-NNNN`, generated once so
/// every token the session requests carries the same subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomIdentity {
    name: String,
}

impl RandomIdentity {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
        let animal = ANIMALS[rng.random_range(0..ANIMALS.len())];
        let suffix: u16 = rng.random_range(0..10_000);
        Self {
            name: format!("{}-{}-{:04}", adjective, animal, suffix),
        }
    }
}

impl Default for RandomIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for RandomIdentity {
    fn identity(&self) -> String {
        self.name.clone()
    }
}
