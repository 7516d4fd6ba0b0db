use crate::debounce::Debounced;
use crate::messages::Presence;

/// Presence as observers see it. Controller connectivity and a device's
/// `disabled` flag both mask the debounced state without touching it.
pub fn overlay(controller_connected: bool, disabled: bool, debounced: Debounced) -> Presence {
    if !controller_connected || disabled {
        return Presence::Unavailable;
    }
    match debounced {
        Debounced::Home => Presence::Home,
        Debounced::NotHome => Presence::NotHome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay() {
        assert_eq!(overlay(true, false, Debounced::Home), Presence::Home);
        assert_eq!(overlay(true, false, Debounced::NotHome), Presence::NotHome);
        assert_eq!(overlay(false, false, Debounced::Home), Presence::Unavailable);
        assert_eq!(overlay(false, false, Debounced::NotHome), Presence::Unavailable);
        assert_eq!(overlay(true, true, Debounced::Home), Presence::Unavailable);
    }
}
