use std::fmt;

/// Extension points an object may implement. Kinds come from the code's
/// `capabilities()` declaration; hook capabilities come from the functions
/// the code defines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Capability {
    Living,
    Room,
    Item,
    Weapon,
    Armor,
    Player,
    Heartbeat,
    Reload,
    Enter,
    Leave,
    Reset,
    Damage,
    Death,
    Kill,
    AttackModifier,
    DefendModifier,
}

impl Capability {
    pub const ALL: [Capability; 16] = [
        Capability::Living,
        Capability::Room,
        Capability::Item,
        Capability::Weapon,
        Capability::Armor,
        Capability::Player,
        Capability::Heartbeat,
        Capability::Reload,
        Capability::Enter,
        Capability::Leave,
        Capability::Reset,
        Capability::Damage,
        Capability::Death,
        Capability::Kill,
        Capability::AttackModifier,
        Capability::DefendModifier,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Living => "living",
            Capability::Room => "room",
            Capability::Item => "item",
            Capability::Weapon => "weapon",
            Capability::Armor => "armor",
            Capability::Player => "player",
            Capability::Heartbeat => "heartbeat",
            Capability::Reload => "reload",
            Capability::Enter => "enter",
            Capability::Leave => "leave",
            Capability::Reset => "reset",
            Capability::Damage => "damage",
            Capability::Death => "death",
            Capability::Kill => "kill",
            Capability::AttackModifier => "attack_modifier",
            Capability::DefendModifier => "defend_modifier",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|cap| cap.as_str() == normalized)
    }

    /// Kinds may be declared by code; hook capabilities may not.
    pub fn is_kind(self) -> bool {
        matches!(
            self,
            Capability::Living
                | Capability::Room
                | Capability::Item
                | Capability::Weapon
                | Capability::Armor
                | Capability::Player
        )
    }

    /// Hook function that grants this capability, if any.
    pub fn hook(self) -> Option<(&'static str, usize)> {
        match self {
            Capability::Heartbeat => Some(("heartbeat", 0)),
            Capability::Reload => Some(("on_reload", 1)),
            Capability::Enter => Some(("on_enter", 1)),
            Capability::Leave => Some(("on_leave", 1)),
            Capability::Reset => Some(("reset", 0)),
            Capability::Damage => Some(("on_damage", 2)),
            Capability::Death => Some(("on_death", 1)),
            Capability::Kill => Some(("on_kill", 1)),
            Capability::AttackModifier => Some(("attack_modifier", 1)),
            Capability::DefendModifier => Some(("defend_modifier", 1)),
            _ => None,
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.insert(cap);
        self
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .into_iter()
            .filter(move |cap| self.contains(*cap))
    }

    pub fn labels(self) -> Vec<String> {
        self.iter().map(|cap| cap.as_str().to_string()).collect()
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_every_label() {
        for cap in Capability::ALL {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse(" Living "), Some(Capability::Living));
        assert_eq!(Capability::parse("wizard"), None);
    }

    #[test]
    fn set_tracks_membership() {
        let set: CapabilitySet = [Capability::Living, Capability::Heartbeat]
            .into_iter()
            .collect();
        assert!(set.contains(Capability::Living));
        assert!(!set.contains(Capability::Room));
        assert_eq!(set.labels(), vec!["living", "heartbeat"]);
    }

    #[test]
    fn only_kinds_are_declarable() {
        assert!(Capability::Weapon.is_kind());
        assert!(!Capability::Heartbeat.is_kind());
        assert_eq!(Capability::Heartbeat.hook(), Some(("heartbeat", 0)));
        assert_eq!(Capability::Living.hook(), None);
    }
}
