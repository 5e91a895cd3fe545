use super::structs::{ChannelRole, MeterModel, OffsetSpec};

/// Everything the pipeline needs to know about one meter
#[derive(Debug, Clone, PartialEq)]
pub struct MeterProfile {
    pub model: MeterModel,
    pub total_length: usize,
    pub channels: Vec<OffsetSpec>,
}

/// Built-in profile of a meter model, `None` for `MeterModel::Custom`
pub fn get_meter_profile(model: &MeterModel) -> Option<MeterProfile> {
    match model {
        MeterModel::IskraMt681 => Some(MeterProfile {
            model: MeterModel::IskraMt681,
            total_length: 456,
            channels: get_iskra_mt681_channels(),
        }),
        MeterModel::EmhEhzb => Some(MeterProfile {
            model: MeterModel::EmhEhzb,
            total_length: 760,
            channels: get_emh_ehzb_channels(),
        }),
        MeterModel::Custom => None,
    }
}

// Iskraemeco MT681, energy registers are 40 bit wide
fn get_iskra_mt681_channels() -> Vec<OffsetSpec> {
    vec![
        OffsetSpec::new("total_energy_consumed", "070100010800ff", 42, 10, 10000.0, ChannelRole::Consumption),  // 1.8.0
        OffsetSpec::new("total_energy_delivered", "070100020800ff", 34, 10, 10000.0, ChannelRole::FeedIn),     // 2.8.0
        OffsetSpec::new("current_power", "070100100700ff", 28, 8, 1.0, ChannelRole::Power),                    // 16.7.0
        OffsetSpec::new("active_power_l1", "070100240700ff", 28, 8, 1.0, ChannelRole::Power),                  // 36.7.0
        OffsetSpec::new("active_power_l2", "070100380700ff", 28, 8, 1.0, ChannelRole::Power),                  // 56.7.0
        OffsetSpec::new("active_power_l3", "0701004c0700ff", 28, 8, 1.0, ChannelRole::Power),                  // 76.7.0
    ]
}

// EMH eHZ-B, energy registers are 64 bit wide
fn get_emh_ehzb_channels() -> Vec<OffsetSpec> {
    vec![
        OffsetSpec::new("total_energy_consumed", "070100010800ff", 48, 16, 10000.0, ChannelRole::Consumption),
        OffsetSpec::new("total_energy_delivered", "070100020800ff", 42, 16, 10000.0, ChannelRole::FeedIn),
        OffsetSpec::new("current_power", "070100100700ff", 42, 8, 1.0, ChannelRole::Power),
        OffsetSpec::new("active_power_l1", "070100240700ff", 42, 8, 1.0, ChannelRole::Power),
        OffsetSpec::new("active_power_l2", "070100380700ff", 42, 8, 1.0, ChannelRole::Power),
        OffsetSpec::new("active_power_l3", "0701004c0700ff", 42, 8, 1.0, ChannelRole::Power),
        OffsetSpec::new("voltage_l1", "070100200700ff", 42, 8, 10.0, ChannelRole::Instant),                   // 32.7.0
        OffsetSpec::new("voltage_l2", "070100340700ff", 42, 8, 10.0, ChannelRole::Instant),                   // 52.7.0
        OffsetSpec::new("voltage_l3", "070100480700ff", 42, 8, 10.0, ChannelRole::Instant),                   // 72.7.0
        OffsetSpec::new("current_l1", "0701001f0700ff", 42, 8, 100.0, ChannelRole::Instant),                  // 31.7.0
        OffsetSpec::new("current_l2", "070100330700ff", 42, 8, 100.0, ChannelRole::Instant),                  // 51.7.0
        OffsetSpec::new("current_l3", "070100470700ff", 42, 8, 100.0, ChannelRole::Instant),                  // 71.7.0
    ]
}
