//! Built-in value types, capabilities and device types.

use crate::device::{ArgumentSpec, TypeSpec};

use super::values::{self, ValueType};
use super::{Catalog, CapabilityDef, DeviceTypeDef};

pub(super) fn register(catalog: &mut Catalog) {
    register_values(catalog);
    register_capabilities(catalog);
    register_types(catalog);
}

fn register_values(catalog: &mut Catalog) {
    catalog.register_value_type("mixed", ValueType::passthrough());
    catalog.register_value_type("object", ValueType::passthrough());
    catalog.register_value_type("boolean", ValueType::new(values::to_boolean));
    catalog.register_value_type("number", ValueType::new(values::to_number));
    catalog.register_value_type("string", ValueType::new(values::to_string));
    catalog.register_value_type("percentage", ValueType::new(values::to_percentage));

    // Measurements travel as plain numbers in their base unit.
    for unit in ["temperature", "illuminance", "mass"] {
        catalog.register_value_type(unit, ValueType::new(values::to_number));
    }
}

fn register_capabilities(catalog: &mut Catalog) {
    catalog.register_capability(
        CapabilityDef::new("state")
            .event("state", TypeSpec::new("object").described("Emitted when the state changes"))
            .action("state", vec![], TypeSpec::new("object").described("The current state")),
    );

    catalog.register_capability(
        CapabilityDef::new("power")
            .requires("state")
            .event(
                "power",
                TypeSpec::new("boolean").described("Device has either been turned on or off"),
            )
            .action(
                "power",
                vec![ArgumentSpec::optional("boolean")],
                TypeSpec::new("boolean").described("If the device has power"),
            )
            .action(
                "setPower",
                vec![ArgumentSpec::required("boolean")],
                TypeSpec::new("boolean").described("The new power of the device"),
            )
            .action("turnOn", vec![], TypeSpec::new("boolean").described("If the device has power"))
            .action("turnOff", vec![], TypeSpec::new("boolean").described("If the device has power"))
            .state("power", TypeSpec::new("boolean").described("If power is on or off")),
    );

    catalog.register_capability(
        CapabilityDef::new("battery-level")
            .event(
                "batteryLevel",
                TypeSpec::new("percentage").described("Battery level has changed"),
            )
            .action(
                "batteryLevel",
                vec![],
                TypeSpec::new("percentage").described("The current battery level as percentage"),
            ),
    );

    // Marker: the device name may be changed and is persisted.
    catalog.register_capability(CapabilityDef::new("nameable"));
}

fn register_types(catalog: &mut Catalog) {
    let percent_in_state_out = || {
        (
            vec![ArgumentSpec::required("percentage")],
            TypeSpec::new("object").described("The new state"),
        )
    };
    let mut dimmable = CapabilityDef::new("dimmable");
    for action in ["setBrightness", "increaseBrightness", "decreaseBrightness"] {
        let (args, returns) = percent_in_state_out();
        dimmable = dimmable.action(action, args, returns);
    }

    catalog.register_device_type(
        DeviceTypeDef::new("light")
            .requires("state")
            .requires("power")
            .when(dimmable),
    );

    catalog.register_device_type(
        DeviceTypeDef::new("sensor")
            .action(
                "values",
                vec![],
                TypeSpec::new("object").described("Object with values of the sensor"),
            )
            .when(
                CapabilityDef::new("temperature")
                    .event("sensor:temperature", TypeSpec::new("temperature"))
                    .action(
                        "temperature",
                        vec![],
                        TypeSpec::new("temperature").described("Temperature in Celsius"),
                    ),
            )
            .when(
                CapabilityDef::new("illuminance")
                    .event("sensor:illuminance", TypeSpec::new("illuminance"))
                    .action(
                        "illuminance",
                        vec![],
                        TypeSpec::new("illuminance").described("Luminance in lux"),
                    ),
            )
            .when(
                CapabilityDef::new("relativeHumidity")
                    .event("sensor:relativeHumidity", TypeSpec::new("percentage"))
                    .action(
                        "relativeHumidity",
                        vec![],
                        TypeSpec::new("percentage").described("Relative humidity as percentage"),
                    ),
            )
            .when(
                CapabilityDef::new("ultraviolet")
                    .event("sensor:ultraviolet", TypeSpec::new("number"))
                    .action(
                        "ultraviolet",
                        vec![],
                        TypeSpec::new("number").described("UV-index as number"),
                    ),
            )
            .when(
                CapabilityDef::new("weight")
                    .event("sensor:weight", TypeSpec::new("mass"))
                    .action("weight", vec![], TypeSpec::new("mass").described("Measured weight")),
            ),
    );
}
