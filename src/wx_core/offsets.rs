use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Module-relative offsets for one v3 client build: nickname, account,
/// phone, a reserved slot, and the key-pointer slot, in that order.
pub type VersionOffsets = Vec<u64>;

pub const NICKNAME_OFFSET: usize = 0;
pub const ACCOUNT_OFFSET: usize = 1;
pub const PHONE_OFFSET: usize = 2;
pub const KEY_OFFSET: usize = 4;

/// Known v3 builds, keyed by the full dotted version string. Collected
/// from the PyWxDump offset corpus; a zero entry means that slot is not
/// usable for that build.
const WX_OFFS_JSON: &str = r#"{
  "3.2.1.154": [328121948, 328122328, 328123056, 328121976, 328123020],
  "3.3.0.115": [31323364, 31323744, 31324472, 31323392, 31324436],
  "3.3.0.84": [31315212, 31315592, 31316320, 31315240, 31316284],
  "3.3.0.93": [31323364, 31323744, 31324472, 31323392, 31324436],
  "3.3.5.34": [30603028, 30603408, 30604120, 30603056, 30604100],
  "3.3.5.42": [30603012, 30603392, 30604120, 30603040, 30604084],
  "3.3.5.46": [30578372, 30578752, 30579480, 30578400, 30579444],
  "3.4.0.37": [31608116, 31608496, 31609224, 31608144, 31609188],
  "3.4.0.38": [31604044, 31604424, 31605152, 31604072, 31605116],
  "3.4.0.50": [31688500, 31688880, 31689608, 31688528, 31689572],
  "3.4.0.54": [31700852, 31701248, 31700920, 31700880, 31701924],
  "3.4.5.27": [32133788, 32134168, 32134896, 32133816, 32134860],
  "3.4.5.45": [32147012, 32147392, 32147064, 32147040, 32148084],
  "3.5.0.20": [35494484, 35494864, 35494536, 35494512, 35495556],
  "3.5.0.29": [35507980, 35508360, 35508032, 35508008, 35509052],
  "3.5.0.33": [35512140, 35512520, 35512192, 35512168, 35513212],
  "3.5.0.39": [35516236, 35516616, 35516288, 35516264, 35517308],
  "3.5.0.42": [35512140, 35512520, 35512192, 35512168, 35513212],
  "3.5.0.44": [35510836, 35511216, 35510896, 35510864, 35511908],
  "3.5.0.46": [35506740, 35507120, 35506800, 35506768, 35507812],
  "3.6.0.18": [35842996, 35843376, 35843048, 35843024, 35844068],
  "3.6.5.7": [35864356, 35864736, 35864408, 35864384, 35865428],
  "3.6.5.16": [35909428, 35909808, 35909480, 35909456, 35910500],
  "3.7.0.26": [37105908, 37106288, 37105960, 37105936, 37106980],
  "3.7.0.29": [37105908, 37106288, 37105960, 37105936, 37106980],
  "3.7.0.30": [37118196, 37118576, 37118248, 37118224, 37119268],
  "3.7.5.11": [37883280, 37884088, 37883136, 37883008, 37884052],
  "3.7.5.23": [37895736, 37896544, 37895592, 37883008, 37896508],
  "3.7.5.27": [37895736, 37896544, 37895592, 37895464, 37896508],
  "3.7.5.31": [37903928, 37904736, 37903784, 37903656, 37904700],
  "3.7.6.24": [38978840, 38979648, 38978696, 38978604, 38979612],
  "3.7.6.29": [38986376, 38987184, 38986232, 38986104, 38987148],
  "3.7.6.44": [39016520, 39017328, 39016376, 38986104, 39017292],
  "3.8.0.31": [46064088, 46064912, 46063944, 38986104, 46064876],
  "3.8.0.33": [46059992, 46060816, 46059848, 38986104, 46060780],
  "3.8.0.41": [46064024, 46064848, 46063880, 38986104, 46064812],
  "3.8.1.26": [46409448, 46410272, 46409304, 38986104, 46410236],
  "3.9.0.28": [48418376, 48419280, 48418232, 38986104, 48419244],
  "3.9.2.23": [50320784, 50321712, 50320640, 38986104, 50321676],
  "3.9.2.26": [50329040, 50329968, 50328896, 38986104, 50329932],
  "3.9.5.81": [61650872, 61652208, 61650680, 0, 61652144],
  "3.9.5.91": [61654904, 61656240, 61654712, 38986104, 61656176],
  "3.9.6.19": [61997688, 61997464, 61997496, 38986104, 61998960],
  "3.9.6.33": [62030600, 62031936, 62030408, 0, 62031872],
  "3.9.7.15": [63482696, 63484032, 63482504, 0, 63483968],
  "3.9.7.25": [63482760, 63484096, 63482568, 0, 63484032],
  "3.9.7.29": [63486984, 63488320, 63486792, 0, 63488256],
  "3.9.8.12": [53479320, 53480288, 53479176, 0, 53480252],
  "3.9.8.15": [64996632, 64997968, 64996440, 0, 64997904],
  "3.9.8.25": [65000920, 65002256, 65000728, 0, 65002192],
  "3.9.9.27": [68065304, 68066640, 68065112, 0, 68066576],
  "3.9.9.35": [68065304, 68066640, 68065112, 0, 68066576],
  "3.9.9.43": [68065944, 68067280, 68065752, 0, 68067216],
  "3.9.10.19": [95129768, 95131104, 95129576, 0, 95131040],
  "3.9.10.27": [95125656, 95126992, 95125464, 0, 95126928],
  "3.9.11.17": [93550360, 93551696, 93550168, 0, 93551632],
  "3.9.11.19": [93550296, 93551632, 93550104, 0, 93551568],
  "3.9.11.23": [93701208, 93700984, 93701016, 0, 93700920],
  "3.9.11.25": [93701080, 93702416, 93700888, 0, 93702352],
  "3.9.12.15": [93813544, 93814880, 93813352, 0, 93814816],
  "3.9.12.17": [93834984, 93836320, 93834792, 0, 93836256],
  "3.9.12.31": [94516904, 94518240, 94516712, 0, 94518176],
  "3.9.12.37": [94520808, 94522144, 94522146, 0, 94522080],
  "3.9.12.45": [94503784, 94505120, 94503592, 0, 94505056],
  "3.9.12.51": [94555176, 94556512, 94554984, 0, 94556448],
  "3.9.12.55": [94550988, 94552544, 94551016, 0, 94552480]
}"#;

static WX_OFFS: Lazy<HashMap<String, VersionOffsets>> = Lazy::new(|| {
    serde_json::from_str(WX_OFFS_JSON).expect("embedded offset table parses")
});

/// Offsets for a full version string, or None for unlisted builds.
pub fn offsets_for(full_version: &str) -> Option<&'static VersionOffsets> {
    WX_OFFS.get(full_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_version_resolves() {
        let offs = offsets_for("3.9.12.55").expect("listed build");
        assert_eq!(offs.len(), 5);
        assert_eq!(offs[NICKNAME_OFFSET], 94550988);
        assert_eq!(offs[KEY_OFFSET], 94552480);
    }

    #[test]
    fn unlisted_version_is_none() {
        assert!(offsets_for("4.0.0.1").is_none());
        assert!(offsets_for("").is_none());
    }

    #[test]
    fn every_entry_has_five_slots() {
        for (version, offs) in WX_OFFS.iter() {
            assert_eq!(offs.len(), 5, "bad entry for {}", version);
        }
    }
}
