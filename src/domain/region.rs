//! Server region families and the most-common-region rule.
//!
//! Game servers report a variety of regional names (`US-East`,
//! `Comp-UK`, `Singapore`, ...). A player's common region is computed over
//! families of those names rather than the raw strings.

use std::collections::BTreeMap;

/// Maps a server region to its family, `None` for unknown regions.
#[must_use]
pub fn region_family(region: &str) -> Option<&'static str> {
    let family = match region {
        "Asia" | "Asia-Oceana" | "Asia-Oceania" | "Australia" | "Japan" | "Oceania"
        | "Singapore" => "Asia-Oceania",
        "Atlantic" => "Atlantic",
        "Comp-UK" | "Europe" | "UK" => "Europe",
        "Comp-US-East" | "Comp-US-West" | "North-America" | "US-Central" | "US-East"
        | "US-West" => "North-America",
        "Middle-East" => "Middle-East",
        "SaoPaulo" | "South-America" => "South-America",
        _ => return None,
    };
    Some(family)
}

/// Picks the family with the most matches from per-region match counts.
///
/// Counts for regions of the same family are summed; unknown regions are
/// ignored. Ties go to the lexicographically smallest family.
#[must_use]
pub fn most_common_region<'a, I>(counts: I) -> Option<&'static str>
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    let mut families: BTreeMap<&'static str, u64> = BTreeMap::new();
    for (region, count) in counts {
        if let Some(family) = region_family(region) {
            *families.entry(family).or_default() += count;
        }
    }
    // BTreeMap iterates in key order, so the first maximum wins ties.
    families
        .into_iter()
        .fold(None, |best: Option<(&'static str, u64)>, (family, count)| match best {
            Some((_, top)) if top >= count => best,
            _ => Some((family, count)),
        })
        .filter(|(_, count)| *count > 0)
        .map(|(family, _)| family)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_group_regions() {
        assert_eq!(region_family("US-East"), Some("North-America"));
        assert_eq!(region_family("Comp-UK"), Some("Europe"));
        assert_eq!(region_family("Asia-Oceana"), Some("Asia-Oceania"));
        assert_eq!(region_family("SaoPaulo"), Some("South-America"));
        assert_eq!(region_family("Moon"), None);
    }

    #[test]
    fn counts_are_summed_per_family() {
        let counts = [("US-East", 3), ("US-West", 2), ("Europe", 4)];
        assert_eq!(most_common_region(counts), Some("North-America"));
    }

    #[test]
    fn ties_break_lexicographically() {
        let counts = [("Europe", 2), ("Atlantic", 2), ("US-East", 1)];
        assert_eq!(most_common_region(counts), Some("Atlantic"));
    }

    #[test]
    fn unknown_only_yields_none() {
        assert_eq!(most_common_region([("Moon", 5)]), None);
        assert_eq!(most_common_region(Vec::<(&str, u64)>::new()), None);
    }
}
